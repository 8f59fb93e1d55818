//! Hindley-Milner type inference
//!
//! A constraint-and-unify pass over the typed AST: the builder left fresh
//! type variables at unknown positions; this pass collects equality
//! constraints from assignments, returns, argument passing, and operator
//! applications, plus softer join constraints at branch merges, and solves
//! them with a worklist unifier. It fails only on provable conflict (a
//! variable forced to be simultaneously, say, integer and string). Numeric
//! literals drive unification across the call graph, which is what lets
//! the emitter keep arithmetic unboxed without signatures.
//!
//! The final substitution is applied to the whole program in place;
//! variables that survive solving degrade to `untyped` (boxed) with a
//! diagnostic.

pub mod unify;

use crate::tast::{
    map_types, Dispatch, TExpr, TExprKind, TFunction, TMlhs, TProgram, TTarget,
};
use crate::types::Type;
use std::collections::HashMap;
use unify::{unify, Subst};

/// One collected constraint. `Eq` is solved by unification; `Join` binds a
/// merge variable to the lattice join of its (substituted) parts and never
/// fails.
#[derive(Debug, Clone)]
enum Constraint {
    Eq(Type, Type, String),
    /// Like `Eq`, but a conflict is not an error: polymorphic argument
    /// passing is resolved by the monomorphizer, not the unifier.
    SoftEq(Type, Type, String),
    Join(Type, Vec<Type>, String),
}

/// Infer and rewrite types across the program. Returns the number of
/// variables that could not be resolved (degraded to `untyped`).
pub fn run(program: &mut TProgram) -> Result<usize, String> {
    let mut cx = Collector {
        constraints: Vec::new(),
        fn_sigs: HashMap::new(),
        ivar_types: program.ivar_types.clone(),
        cvar_types: program.cvar_types.clone(),
        gvar_types: program.gvar_types.clone(),
    };
    for f in &program.functions {
        cx.fn_sigs.insert(
            f.key.clone(),
            (
                f.params.iter().map(|p| p.ty.clone()).collect(),
                f.ret_ty.clone(),
            ),
        );
    }
    for f in &program.functions {
        cx.collect_function(f);
    }

    let subst = solve(cx.constraints)?;

    let mut unresolved = 0usize;
    map_types(program, &|t: &Type| {
        let applied = subst.apply(t);
        applied
    });
    map_types(program, &|t: &Type| match t {
        Type::Var(name) => {
            tracing::debug!(var = %name, "unresolved type variable degrades to untyped");
            Type::Value
        }
        other if other.has_var() => scrub_vars(other),
        other => other.clone(),
    });
    // count after scrubbing for the diagnostic summary
    for f in &program.functions {
        for p in &f.params {
            if p.ty == Type::Value {
                unresolved += 1;
            }
        }
    }
    Ok(unresolved)
}

fn scrub_vars(t: &Type) -> Type {
    match t {
        Type::Var(_) => Type::Value,
        Type::Class { name, args } => Type::Class {
            name: name.clone(),
            args: args.iter().map(scrub_vars).collect(),
        },
        Type::Union(members) => Type::union(members.iter().map(scrub_vars).collect()),
        Type::Function { params, ret, may_raise } => Type::Function {
            params: params.iter().map(scrub_vars).collect(),
            ret: Box::new(scrub_vars(ret)),
            may_raise: *may_raise,
        },
        other => other.clone(),
    }
}

/// Worklist solver: equality constraints first (unify + compose), then join
/// constraints to a fixpoint.
fn solve(constraints: Vec<Constraint>) -> Result<Subst, String> {
    let mut subst = Subst::empty();
    let mut joins = Vec::new();
    for c in constraints {
        match c {
            Constraint::Eq(a, b, why) => {
                let a = subst.apply(&a);
                let b = subst.apply(&b);
                let s = unify(&a, &b).map_err(|e| format!("{} ({})", e, why))?;
                subst = subst.compose(&s);
            }
            Constraint::SoftEq(a, b, why) => {
                let a = subst.apply(&a);
                let b = subst.apply(&b);
                match unify(&a, &b) {
                    Ok(s) => subst = subst.compose(&s),
                    Err(_) => {
                        // polymorphic use; the monomorphizer specializes
                        // the callee per concrete argument tuple instead
                        tracing::debug!(constraint = %why, "soft constraint left polymorphic");
                    }
                }
            }
            Constraint::Join(..) => joins.push(c),
        }
    }

    // joins bind merge variables to the lattice join of their resolved
    // parts; iterate to a fixpoint because joins can feed each other
    let mut changed = true;
    while changed {
        changed = false;
        for c in &joins {
            let Constraint::Join(result, parts, _why) = c else { continue };
            let result = subst.apply(result);
            let Type::Var(name) = result else { continue };
            let resolved: Vec<Type> = parts
                .iter()
                .map(|p| subst.apply(p))
                .filter(|p| !p.has_var() && *p != Type::Unit)
                .collect();
            if resolved.is_empty() {
                continue;
            }
            let joined = resolved
                .into_iter()
                .reduce(Type::join)
                .unwrap_or(Type::Value);
            subst.bind(&name, joined);
            changed = true;
        }
    }
    Ok(subst)
}

struct Collector {
    constraints: Vec<Constraint>,
    fn_sigs: HashMap<String, (Vec<Type>, Type)>,
    ivar_types: HashMap<(String, String), Type>,
    cvar_types: HashMap<(String, String), Type>,
    gvar_types: HashMap<String, Type>,
}

impl Collector {
    fn eq(&mut self, a: &Type, b: &Type, why: impl Into<String>) {
        self.constraints
            .push(Constraint::Eq(a.clone(), b.clone(), why.into()));
    }

    fn soft_eq(&mut self, a: &Type, b: &Type, why: impl Into<String>) {
        self.constraints
            .push(Constraint::SoftEq(a.clone(), b.clone(), why.into()));
    }

    fn join(&mut self, result: &Type, parts: Vec<Type>, why: impl Into<String>) {
        self.constraints
            .push(Constraint::Join(result.clone(), parts, why.into()));
    }

    fn collect_function(&mut self, f: &TFunction) {
        let owner = match &f.owner {
            Some(crate::tast::Owner::Class(c)) => c.clone(),
            Some(crate::tast::Owner::Module(m)) => m.clone(),
            None => String::new(),
        };
        let mut env: HashMap<String, Type> = f
            .params
            .iter()
            .map(|p| (p.name.clone(), p.ty.clone()))
            .collect();
        for (i, e) in f.body.iter().enumerate() {
            let last = i + 1 == f.body.len();
            self.collect_expr(e, f, &owner, &mut env);
            if last {
                self.eq(
                    &f.ret_ty,
                    &e.ty,
                    format!("implicit return of '{}'", f.name),
                );
            }
        }
        if f.body.is_empty() {
            self.eq(&f.ret_ty, &Type::Nil, format!("empty body of '{}'", f.name));
        }
    }

    fn collect_body(
        &mut self,
        body: &[TExpr],
        f: &TFunction,
        owner: &str,
        env: &mut HashMap<String, Type>,
    ) {
        for e in body {
            self.collect_expr(e, f, owner, env);
        }
    }

    fn collect_target(
        &mut self,
        target: &TTarget,
        value_ty: &Type,
        f: &TFunction,
        owner: &str,
        env: &mut HashMap<String, Type>,
    ) {
        match target {
            TTarget::Local(name) => match env.get(name) {
                Some(slot) => {
                    let slot = slot.clone();
                    self.eq(&slot, value_ty, format!("assignment to '{}'", name));
                }
                None => {
                    env.insert(name.clone(), value_ty.clone());
                }
            },
            TTarget::Ivar(name) => {
                let key = (owner.to_string(), name.trim_start_matches('@').to_string());
                if let Some(t) = self.ivar_types.get(&key) {
                    let t = t.clone();
                    self.eq(&t, value_ty, format!("assignment to '{}'", name));
                }
            }
            TTarget::Cvar(name) => {
                let key = (owner.to_string(), name.clone());
                if let Some(t) = self.cvar_types.get(&key) {
                    let t = t.clone();
                    self.eq(&t, value_ty, format!("assignment to '{}'", name));
                }
            }
            TTarget::Gvar(name) => {
                if let Some(t) = self.gvar_types.get(name) {
                    let t = t.clone();
                    self.eq(&t, value_ty, format!("assignment to '{}'", name));
                }
            }
            TTarget::Attr { recv, .. } => self.collect_expr(recv, f, owner, env),
            TTarget::Index { recv, index } => {
                self.collect_expr(recv, f, owner, env);
                self.collect_expr(index, f, owner, env);
            }
        }
    }

    fn collect_expr(
        &mut self,
        e: &TExpr,
        f: &TFunction,
        owner: &str,
        env: &mut HashMap<String, Type>,
    ) {
        match &e.kind {
            TExprKind::ArrayLit(items) => self.collect_body(items, f, owner, env),
            TExprKind::HashLit(pairs) => {
                for (k, v) in pairs {
                    self.collect_expr(k, f, owner, env);
                    self.collect_expr(v, f, owner, env);
                }
            }
            TExprKind::RangeLit { low, high, .. } => {
                if let Some(l) = low {
                    self.collect_expr(l, f, owner, env);
                }
                if let Some(h) = high {
                    self.collect_expr(h, f, owner, env);
                }
            }
            TExprKind::LocalGet(name) => {
                env.entry(name.clone()).or_insert_with(|| e.ty.clone());
            }
            TExprKind::Assign { target, value } => {
                self.collect_expr(value, f, owner, env);
                self.collect_target(target, &value.ty, f, owner, env);
            }
            TExprKind::OpAssign { target, op, value } => {
                self.collect_expr(value, f, owner, env);
                // x op= e behaves as x = x.op(e); numeric ops tie the operand
                if is_arith_op(op) {
                    self.eq(&e.ty, &value.ty, format!("compound '{}=' operand", op));
                }
                self.collect_target(target, &e.ty, f, owner, env);
            }
            TExprKind::OrAssign { target, value } | TExprKind::AndAssign { target, value } => {
                self.collect_expr(value, f, owner, env);
                self.join(
                    &e.ty,
                    vec![value.ty.clone()],
                    "conditional assignment".to_string(),
                );
                self.collect_target(target, &e.ty, f, owner, env);
            }
            TExprKind::MultiAssign { targets, value } => {
                self.collect_expr(value, f, owner, env);
                for t in targets {
                    if let TMlhs::Target(t) = t {
                        self.collect_target(t, &Type::Value, f, owner, env);
                    }
                }
            }
            TExprKind::ConstAssign { value, .. } => self.collect_expr(value, f, owner, env),

            TExprKind::Call { receiver, method, args, kwargs, block, dispatch, .. } => {
                if let Some(r) = receiver {
                    self.collect_expr(r, f, owner, env);
                }
                self.collect_body(args, f, owner, env);
                for (_, v) in kwargs {
                    self.collect_expr(v, f, owner, env);
                }
                if let Some(b) = block {
                    let mut benv = env.clone();
                    for p in &b.params {
                        benv.insert(p.name.clone(), p.ty.clone());
                    }
                    self.collect_body(&b.body, f, owner, &mut benv);
                }

                // argument passing into functions compiled in this unit
                if let Dispatch::Direct { key } = dispatch {
                    if let Some((params, ret)) = self.fn_sigs.get(key).cloned() {
                        for (a, p) in args.iter().zip(params.iter()) {
                            self.soft_eq(
                                p,
                                &a.ty,
                                format!("argument to '{}'", method),
                            );
                        }
                        self.soft_eq(&e.ty, &ret, format!("result of '{}'", method));
                    }
                }

                // numeric operator propagation for dynamic receivers
                if let Some(r) = receiver {
                    if args.len() == 1 && is_arith_op(method) {
                        self.eq(
                            &r.ty,
                            &args[0].ty,
                            format!("operands of '{}'", method),
                        );
                        self.eq(&e.ty, &r.ty, format!("result of '{}'", method));
                    } else if args.len() == 1 && is_cmp_op(method) {
                        self.eq(
                            &r.ty,
                            &args[0].ty,
                            format!("operands of '{}'", method),
                        );
                        self.eq(&e.ty, &Type::Bool, format!("result of '{}'", method));
                    }
                }
            }
            TExprKind::SuperCall { args, .. } | TExprKind::YieldExpr { args } => {
                self.collect_body(args, f, owner, env);
            }
            TExprKind::LambdaLit { block } => {
                let mut benv = env.clone();
                for p in &block.params {
                    benv.insert(p.name.clone(), p.ty.clone());
                }
                self.collect_body(&block.body, f, owner, &mut benv);
            }
            TExprKind::And { lhs, rhs } | TExprKind::Or { lhs, rhs } => {
                self.collect_expr(lhs, f, owner, env);
                self.collect_expr(rhs, f, owner, env);
                self.join(
                    &e.ty,
                    vec![lhs.ty.clone(), rhs.ty.clone()],
                    "logical operator join".to_string(),
                );
            }
            TExprKind::Not(v) => self.collect_expr(v, f, owner, env),
            TExprKind::If { cond, then_body, else_body } => {
                self.collect_expr(cond, f, owner, env);
                self.collect_body(then_body, f, owner, env);
                self.collect_body(else_body, f, owner, env);
                let t = then_body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil);
                let el = else_body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil);
                self.join(&e.ty, vec![t, el], "branch join".to_string());
            }
            TExprKind::While { cond, body, .. } => {
                self.collect_expr(cond, f, owner, env);
                self.collect_body(body, f, owner, env);
            }
            TExprKind::CaseIn { subject, clauses, else_body } => {
                self.collect_expr(subject, f, owner, env);
                let mut parts = Vec::new();
                for c in clauses {
                    if let Some(g) = &c.guard {
                        self.collect_expr(g, f, owner, env);
                    }
                    self.collect_body(&c.body, f, owner, env);
                    parts.push(c.body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil));
                }
                if let Some(eb) = else_body {
                    self.collect_body(eb, f, owner, env);
                    parts.push(eb.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil));
                }
                self.join(&e.ty, parts, "pattern-match join".to_string());
            }
            TExprKind::Begin { body, rescues, else_body, ensure_body } => {
                self.collect_body(body, f, owner, env);
                let mut parts =
                    vec![body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil)];
                for r in rescues {
                    self.collect_body(&r.body, f, owner, env);
                    parts.push(r.body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil));
                }
                if !else_body.is_empty() {
                    self.collect_body(else_body, f, owner, env);
                    parts.push(else_body.last().unwrap().ty.clone());
                }
                self.collect_body(ensure_body, f, owner, env);
                self.join(&e.ty, parts, "rescue join".to_string());
            }
            TExprKind::Return(v) => {
                if let Some(v) = v {
                    self.collect_expr(v, f, owner, env);
                    self.eq(
                        &f.ret_ty,
                        &v.ty,
                        format!("explicit return in '{}'", f.name),
                    );
                } else {
                    self.eq(
                        &f.ret_ty,
                        &Type::Nil,
                        format!("bare return in '{}'", f.name),
                    );
                }
            }
            TExprKind::Break(v) | TExprKind::Next(v) => {
                if let Some(v) = v {
                    self.collect_expr(v, f, owner, env);
                }
            }
            TExprKind::Raise { args } => self.collect_body(args, f, owner, env),
            _ => {}
        }
    }
}

fn is_arith_op(op: &str) -> bool {
    matches!(op, "+" | "-" | "*" | "/" | "%" | "**")
}

fn is_cmp_op(op: &str) -> bool {
    matches!(op, "<" | "<=" | ">" | ">=" | "==" | "!=")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::sig::SignatureRegistry;
    use crate::tast;

    fn infer_src(json: &str) -> TProgram {
        let root = Root::from_json(json).expect("CST should parse");
        let registry = SignatureRegistry::new();
        let mut p = tast::build::build(&root, &registry).expect("tast should build");
        run(&mut p).expect("inference should succeed");
        p
    }

    #[test]
    fn test_literals_propagate_through_call_graph() {
        // def add_integers(a, b) = a + b; def test_add = add_integers(1, 2)
        let p = infer_src(
            r#"{"body": [
                 {"kind": "def", "name": "add_integers",
                  "params": {"list": [{"name": "a"}, {"name": "b"}]},
                  "body": [{"kind": "call",
                            "receiver": {"kind": "lvar", "name": "a"},
                            "name": "+",
                            "args": [{"kind": "lvar", "name": "b"}]}]},
                 {"kind": "def", "name": "test_add", "params": {"list": []},
                  "body": [{"kind": "call", "receiver": null, "name": "add_integers",
                            "args": [{"kind": "int", "value": 1},
                                     {"kind": "int", "value": 2}]}]}]}"#,
        );
        let add = p.functions.iter().find(|f| f.key == "add_integers").unwrap();
        assert_eq!(add.params[0].ty, Type::Int);
        assert_eq!(add.params[1].ty, Type::Int);
        assert_eq!(add.ret_ty, Type::Int);
        let test = p.functions.iter().find(|f| f.key == "test_add").unwrap();
        assert_eq!(test.ret_ty, Type::Int);
    }

    #[test]
    fn test_branch_join_binds_merge_variable() {
        let p = infer_src(
            r#"{"body": [
                 {"kind": "def", "name": "pick",
                  "params": {"list": [{"name": "c"}]},
                  "body": [{"kind": "if",
                            "cond": {"kind": "lvar", "name": "c"},
                            "then_body": [{"kind": "int", "value": 10}],
                            "else_body": [{"kind": "int", "value": 20}]}]}]}"#,
        );
        let f = p.functions.iter().find(|f| f.key == "pick").unwrap();
        assert_eq!(f.ret_ty, Type::Int);
    }

    #[test]
    fn test_provable_conflict_is_fatal() {
        let root = Root::from_json(
            r#"{"body": [
                 {"kind": "def", "name": "bad",
                  "params": {"list": [{"name": "x"}]},
                  "body": [
                    {"kind": "call", "receiver": {"kind": "lvar", "name": "x"},
                     "name": "+", "args": [{"kind": "int", "value": 1}]},
                    {"kind": "call", "receiver": {"kind": "lvar", "name": "x"},
                     "name": "+", "args": [{"kind": "str", "value": "s"}]}]}]}"#,
        )
        .unwrap();
        let registry = SignatureRegistry::new();
        let mut p = tast::build::build(&root, &registry).unwrap();
        let err = run(&mut p).unwrap_err();
        assert!(err.contains("Type conflict"), "got: {}", err);
    }

    #[test]
    fn test_unresolved_variables_degrade_to_untyped() {
        let p = infer_src(
            r#"{"body": [
                 {"kind": "def", "name": "mystery",
                  "params": {"list": [{"name": "x"}]},
                  "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "x"},
                            "name": "frobnicate", "args": []}]}]}"#,
        );
        let f = p.functions.iter().find(|f| f.key == "mystery").unwrap();
        assert_eq!(f.params[0].ty, Type::Value);
        assert_eq!(f.ret_ty, Type::Value);
        // nothing in the tree retains an inference variable
        for func in &p.functions {
            assert!(!func.ret_ty.has_var());
            for p in &func.params {
                assert!(!p.ty.has_var());
            }
        }
    }

    #[test]
    fn test_float_int_mix_widens() {
        let p = infer_src(
            r#"{"body": [
                 {"kind": "def", "name": "scale",
                  "params": {"list": [{"name": "x"}]},
                  "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "x"},
                            "name": "*", "args": [{"kind": "float", "value": 0.5}]}]},
                 {"kind": "call", "receiver": null, "name": "scale",
                  "args": [{"kind": "float", "value": 3.0}]}]}"#,
        );
        let f = p.functions.iter().find(|f| f.key == "scale").unwrap();
        assert_eq!(f.params[0].ty, Type::Float);
        assert_eq!(f.ret_ty, Type::Float);
    }
}
