//! Lowering from the typed AST into HIR
//!
//! Each typed function lowers into one HIR function plus any outlined
//! callback functions it needs: block bodies, protected begin/rescue bodies,
//! rescue handlers, else/ensure bodies, and fiber bodies. Compound
//! expressions break into three-address instructions over fresh value ids;
//! control flow becomes explicit blocks and terminators.
//!
//! A root function that outlines anything keeps all of its locals in a
//! shared environment array so callbacks observe mutation; the lowering
//! pre-scans the body to make that decision before allocating slots.

mod exception;
mod expr;
mod pattern;

use super::*;
use crate::tast::{
    Owner, TBlock, TClassDecl, TExpr, TExprKind, TFunction, TModuleDecl, TProgram,
};
use crate::types::Type;
use std::collections::HashMap;

/// Lower a typed program into HIR.
pub fn lower(tprogram: &TProgram) -> Result<Program, String> {
    let mut meta: HashMap<String, Type> = HashMap::new();
    for f in &tprogram.functions {
        meta.insert(f.key.clone(), f.ret_ty.clone());
    }

    let mut program = Program::default();
    for tf in &tprogram.functions {
        let mut rl = RootLower::new(tf, &meta);
        let root = rl.lower_root(tf)?;
        program.functions.push(root);
        program.functions.append(&mut rl.done);
    }
    for c in &tprogram.classes {
        program.classes.push(lower_class(c)?);
    }
    for m in &tprogram.modules {
        program.modules.push(lower_module(m)?);
    }
    Ok(program)
}

fn lower_class(c: &TClassDecl) -> Result<ClassRecord, String> {
    let mut constants = Vec::with_capacity(c.constants.len());
    for (name, e) in &c.constants {
        constants.push((name.clone(), const_value(e, name)?));
    }
    let mut cvar_inits = Vec::with_capacity(c.cvar_inits.len());
    for (name, e) in &c.cvar_inits {
        cvar_inits.push((name.clone(), const_value(e, name)?));
    }
    Ok(ClassRecord {
        name: c.name.clone(),
        superclass: c.superclass.clone(),
        instance_methods: c.instance_methods.clone(),
        singleton_methods: c.singleton_methods.clone(),
        includes: c.includes.clone(),
        extends: c.extends.clone(),
        prepends: c.prepends.clone(),
        aliases: c.aliases.clone(),
        constants,
        cvar_inits,
        private_methods: c.private_methods.clone(),
        protected_methods: c.protected_methods.clone(),
        reopened: c.reopened,
    })
}

fn lower_module(m: &TModuleDecl) -> Result<ModuleRecord, String> {
    let mut constants = Vec::with_capacity(m.constants.len());
    for (name, e) in &m.constants {
        constants.push((name.clone(), const_value(e, name)?));
    }
    Ok(ModuleRecord {
        name: m.name.clone(),
        instance_methods: m.instance_methods.clone(),
        singleton_methods: m.singleton_methods.clone(),
        constants,
    })
}

fn const_value(e: &TExpr, name: &str) -> Result<ConstValue, String> {
    match &e.kind {
        TExprKind::IntLit(v) => Ok(ConstValue::Int(*v)),
        TExprKind::FloatLit(v) => Ok(ConstValue::Float(*v)),
        TExprKind::StrLit(v) => Ok(ConstValue::Str(v.clone())),
        TExprKind::SymLit(v) => Ok(ConstValue::Sym(v.clone())),
        TExprKind::BoolLit(v) => Ok(ConstValue::Bool(*v)),
        TExprKind::NilLit => Ok(ConstValue::Nil),
        _ => Err(format!(
            "Unsupported construct: non-literal initializer for constant '{}'",
            name
        )),
    }
}

/// A function being lowered (the root or one outlined callback).
pub(super) struct Frame {
    pub key: String,
    pub name: String,
    pub kind: FnKind,
    pub params: Vec<FnParam>,
    pub variadic: bool,
    pub is_lambda: bool,
    pub ret_ty: Type,
    pub ret_slot: LocalId,
    pub blocks: Vec<Block>,
    pub cur_label: String,
    pub cur_instrs: Vec<Instr>,
    pub next_value: ValueId,
    pub next_block: u32,
    pub locals_map: HashMap<String, LocalId>,
    /// (continue label, exit label) of enclosing loops
    pub loop_stack: Vec<(String, String)>,
    /// The current block has no predecessors (code after a return/raise)
    pub unreachable: bool,
}

pub(super) struct RootLower<'m> {
    pub meta: &'m HashMap<String, Type>,
    pub frames: Vec<Frame>,
    /// Locals of the root function; when `env` is set, shared by all
    /// outlined callbacks via environment indices
    pub locals: Vec<LocalDecl>,
    pub env: bool,
    pub done: Vec<Function>,
    pub owner: Option<FnOwner>,
    pub singleton: bool,
    pub root_key: String,
    pub outline_counter: u32,
}

impl<'m> RootLower<'m> {
    pub fn new(tf: &TFunction, meta: &'m HashMap<String, Type>) -> RootLower<'m> {
        let owner = tf.owner.as_ref().map(|o| match o {
            Owner::Class(c) => FnOwner::Class(c.clone()),
            Owner::Module(m) => FnOwner::Module(m.clone()),
        });
        RootLower {
            meta,
            frames: Vec::new(),
            locals: Vec::new(),
            env: body_outlines(&tf.body),
            done: Vec::new(),
            owner,
            singleton: tf.singleton,
            root_key: tf.key.clone(),
            outline_counter: 0,
        }
    }

    // ---- frame plumbing -------------------------------------------------

    pub fn fr(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let fr = self.fr();
        let v = fr.next_value;
        fr.next_value += 1;
        v
    }

    pub fn fresh_label(&mut self, prefix: &str) -> String {
        let fr = self.fr();
        let n = fr.next_block;
        fr.next_block += 1;
        format!("{}{}", prefix, n)
    }

    /// Append an instruction to the current block.
    pub fn push(&mut self, op: Op, ty: Type) -> ValueId {
        let dst = self.fresh_value();
        self.fr().cur_instrs.push(Instr { dst, op, ty });
        dst
    }

    /// Finish the current block with `term`.
    pub fn seal(&mut self, term: Terminator) {
        let fr = self.fr();
        let label = std::mem::take(&mut fr.cur_label);
        let instrs = std::mem::take(&mut fr.cur_instrs);
        fr.blocks.push(Block { label, instrs, term });
    }

    /// Begin a new block.
    pub fn start(&mut self, label: String) {
        let fr = self.fr();
        fr.cur_label = label;
        fr.cur_instrs = Vec::new();
        fr.unreachable = false;
    }

    /// Begin a block that has no predecessors (after a diverging statement);
    /// lowering continues so the rest of the body still produces HIR, but
    /// merge points ignore it.
    pub fn start_unreachable(&mut self, label: String) {
        self.start(label);
        self.fr().unreachable = true;
    }

    // ---- locals ---------------------------------------------------------

    /// Resolve a named local, allocating a slot on first use.
    pub fn local(&mut self, name: &str, ty: &Type) -> LocalId {
        if let Some(&id) = self.fr().locals_map.get(name) {
            return id;
        }
        let id = self.alloc_slot(name, ty);
        self.fr().locals_map.insert(name.to_string(), id);
        id
    }

    /// Allocate an anonymous slot in the (possibly shared) local table.
    pub fn alloc_slot(&mut self, name: &str, ty: &Type) -> LocalId {
        let id = self.locals.len();
        self.locals.push(LocalDecl {
            name: name.to_string(),
            ty: ty.clone(),
        });
        id
    }

    pub fn load_slot(&mut self, id: LocalId, ty: &Type) -> ValueId {
        if self.env {
            self.push(Op::LoadEnv(ENV_RESERVED + id), ty.clone())
        } else {
            self.push(Op::LoadLocal(id), ty.clone())
        }
    }

    pub fn store_slot(&mut self, id: LocalId, v: ValueId) {
        if self.env {
            self.push(Op::StoreEnv(ENV_RESERVED + id, v), Type::Unit);
        } else {
            self.push(Op::StoreLocal(id, v), Type::Unit);
        }
    }

    // ---- outlining ------------------------------------------------------

    /// Lower `body` as a separate callback function sharing this root's
    /// environment. Returns the new function's key.
    pub fn outline(
        &mut self,
        kind: FnKind,
        params: &[(String, ParamKind, Type)],
        body: &[TExpr],
        is_lambda: bool,
        ret_ty: Type,
    ) -> Result<String, String> {
        let suffix = match &kind {
            FnKind::BlockBody { .. } => "block",
            FnKind::ProtectedBody { .. } => "body",
            FnKind::RescueHandler { .. } => "rescue",
            FnKind::ElseBody { .. } => "else",
            FnKind::EnsureBody { .. } => "ensure",
            FnKind::FiberBody { .. } => "fiber",
            FnKind::Plain => "fn",
        };
        let n = self.outline_counter;
        self.outline_counter += 1;
        let key = format!("{}::{}{}", self.root_key, suffix, n);

        let parent_map = self.fr().locals_map.clone();
        self.push_frame(key.clone(), key.clone(), kind, ret_ty.clone(), parent_map);

        // parameters spill into shared slots so nested callbacks can
        // capture them too
        for (name, pkind, pty) in params {
            let slot = self.alloc_slot(name, pty);
            self.fr().locals_map.insert(name.clone(), slot);
            self.fr().params.push(FnParam {
                name: name.clone(),
                kind: *pkind,
                ty: pty.clone(),
                local: slot,
            });
        }
        self.fr().is_lambda = is_lambda;

        let value = self.lower_body(body)?;
        self.finish_frame_with(value);
        Ok(key)
    }

    pub fn push_frame(
        &mut self,
        key: String,
        name: String,
        kind: FnKind,
        ret_ty: Type,
        locals_map: HashMap<String, LocalId>,
    ) {
        let ret_slot = self.locals.len();
        self.locals.push(LocalDecl {
            name: format!("__ret{}", self.frames.len()),
            ty: ret_ty.clone(),
        });
        self.frames.push(Frame {
            key,
            name,
            kind,
            params: Vec::new(),
            variadic: false,
            is_lambda: false,
            ret_ty,
            ret_slot,
            blocks: Vec::new(),
            cur_label: "entry".to_string(),
            cur_instrs: Vec::new(),
            next_value: 0,
            next_block: 0,
            locals_map,
            loop_stack: Vec::new(),
            unreachable: false,
        });
    }

    /// Store the fall-through value, emit the epilogue, and convert the
    /// finished frame into a `Function`.
    pub fn finish_frame_with(&mut self, value: Option<ValueId>) {
        let ret_slot = self.fr().ret_slot;
        if !self.fr().unreachable {
            let v = match value {
                Some(v) => v,
                None => self.push(Op::ConstNil, Type::Nil),
            };
            self.store_slot(ret_slot, v);
            self.seal(Terminator::Jump("exit".to_string()));
        } else {
            self.seal(Terminator::Jump("exit".to_string()));
        }
        self.start("exit".to_string());
        let ret_ty = self.fr().ret_ty.clone();
        let rv = self.load_slot(ret_slot, &ret_ty);
        self.seal(Terminator::Return(rv));

        let fr = self.frames.pop().expect("frame to finish");
        let is_root = self.frames.is_empty();
        let func = Function {
            key: fr.key,
            name: fr.name,
            owner: self.owner.clone(),
            singleton: self.singleton,
            kind: fr.kind,
            params: fr.params,
            is_lambda: fr.is_lambda,
            variadic: fr.variadic,
            locals: if is_root { std::mem::take(&mut self.locals) } else { Vec::new() },
            ret_slot: fr.ret_slot,
            env_locals: self.env,
            ret_ty: fr.ret_ty,
            blocks: fr.blocks,
            entry: "entry".to_string(),
        };
        if is_root {
            // the caller takes the root function
            self.done.insert(0, func);
        } else {
            self.done.push(func);
        }
    }

    /// Lower the root function; outlined callbacks accumulate in `done`.
    pub fn lower_root(&mut self, tf: &TFunction) -> Result<Function, String> {
        let variadic = tf
            .params
            .iter()
            .any(|p| {
                matches!(
                    p.label,
                    crate::cst::ParamLabel::Rest
                        | crate::cst::ParamLabel::Keyword
                        | crate::cst::ParamLabel::KeywordOptional
                        | crate::cst::ParamLabel::KeywordRest
                )
            });
        self.push_frame(
            tf.key.clone(),
            tf.name.clone(),
            FnKind::Plain,
            tf.ret_ty.clone(),
            HashMap::new(),
        );
        self.fr().variadic = variadic;
        self.lower_params(tf)?;
        let value = self.lower_body(&tf.body)?;
        self.finish_frame_with(value);
        Ok(self.done.remove(0))
    }

    /// Lower a statement sequence; `None` when the body diverged before
    /// producing a value.
    pub fn lower_body(&mut self, body: &[TExpr]) -> Result<Option<ValueId>, String> {
        let mut last = None;
        for e in body {
            last = Some(self.lower_expr(e)?);
        }
        if self.fr().unreachable {
            return Ok(None);
        }
        Ok(last)
    }
}

/// Does this body contain a construct that lowers into an outlined
/// callback? Decides env-based locals before any slot is allocated.
fn body_outlines(body: &[TExpr]) -> bool {
    body.iter().any(expr_outlines)
}

fn expr_outlines(e: &TExpr) -> bool {
    match &e.kind {
        TExprKind::LambdaLit { .. } => true,
        TExprKind::Call { block, receiver, args, kwargs, .. } => {
            block.is_some()
                || receiver.as_deref().map(expr_outlines).unwrap_or(false)
                || args.iter().any(expr_outlines)
                || kwargs.iter().any(|(_, v)| expr_outlines(v))
        }
        TExprKind::Begin { rescues, ensure_body, body, else_body } => {
            !rescues.is_empty()
                || !ensure_body.is_empty()
                || body.iter().any(expr_outlines)
                || else_body.iter().any(expr_outlines)
        }
        TExprKind::If { cond, then_body, else_body } => {
            expr_outlines(cond)
                || then_body.iter().any(expr_outlines)
                || else_body.iter().any(expr_outlines)
        }
        TExprKind::While { cond, body, .. } => {
            expr_outlines(cond) || body.iter().any(expr_outlines)
        }
        TExprKind::CaseIn { subject, clauses, else_body } => {
            expr_outlines(subject)
                || clauses.iter().any(|c| {
                    c.body.iter().any(expr_outlines)
                        || c.guard.as_deref().map(expr_outlines).unwrap_or(false)
                })
                || else_body
                    .as_ref()
                    .map(|b| b.iter().any(expr_outlines))
                    .unwrap_or(false)
        }
        TExprKind::And { lhs, rhs } | TExprKind::Or { lhs, rhs } => {
            expr_outlines(lhs) || expr_outlines(rhs)
        }
        TExprKind::Not(v) => expr_outlines(v),
        TExprKind::Assign { value, .. }
        | TExprKind::OpAssign { value, .. }
        | TExprKind::OrAssign { value, .. }
        | TExprKind::AndAssign { value, .. }
        | TExprKind::MultiAssign { value, .. }
        | TExprKind::ConstAssign { value, .. } => expr_outlines(value),
        TExprKind::ArrayLit(items) => items.iter().any(expr_outlines),
        TExprKind::HashLit(pairs) => {
            pairs.iter().any(|(k, v)| expr_outlines(k) || expr_outlines(v))
        }
        TExprKind::Return(v) | TExprKind::Break(v) | TExprKind::Next(v) => {
            v.as_deref().map(expr_outlines).unwrap_or(false)
        }
        TExprKind::SuperCall { args, .. }
        | TExprKind::YieldExpr { args }
        | TExprKind::Raise { args } => args.iter().any(expr_outlines),
        _ => false,
    }
}

pub(super) fn block_params_of(b: &TBlock) -> Vec<(String, ParamKind, Type)> {
    b.params
        .iter()
        .map(|p| {
            let kind = match p.label {
                crate::cst::ParamLabel::Rest => ParamKind::Rest,
                crate::cst::ParamLabel::Optional => ParamKind::Optional,
                _ => ParamKind::Required,
            };
            (p.name.clone(), kind, p.ty.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::hir::{validate, Op, RaiseKind, Terminator};
    use crate::sig::SignatureRegistry;
    use crate::tast;

    fn lower_src(json: &str) -> Program {
        let root = Root::from_json(json).expect("CST should parse");
        let registry = SignatureRegistry::new();
        let mut tp = tast::build::build(&root, &registry).expect("tast should build");
        crate::infer::run(&mut tp).expect("inference should pass");
        let p = lower(&tp).expect("lowering should succeed");
        validate::validate(&p).expect("lowered HIR should validate");
        p
    }

    fn find<'a>(p: &'a Program, key: &str) -> &'a Function {
        p.function(key).unwrap_or_else(|| panic!("function '{}' missing", key))
    }

    fn all_ops(f: &Function) -> Vec<&Op> {
        f.blocks.iter().flat_map(|b| b.instrs.iter().map(|i| &i.op)).collect()
    }

    #[test]
    fn test_single_terminator_per_block() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "f", "params": {"list": []},
                          "body": [{"kind": "int", "value": 1}]}]}"#,
        );
        let f = find(&p, "f");
        // every block has exactly one terminator by construction; the
        // validator checked operands and labels
        assert!(f.blocks.len() >= 2);
        assert!(f.block("entry").is_some());
        assert!(f.block("exit").is_some());
    }

    #[test]
    fn test_if_expression_lowers_to_phi() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "choose",
                          "params": {"list": [{"name": "c"}]},
                          "body": [{"kind": "if",
                                    "cond": {"kind": "lvar", "name": "c"},
                                    "then_body": [{"kind": "int", "value": 10}],
                                    "else_body": [{"kind": "int", "value": 20}]}]}]}"#,
        );
        let f = find(&p, "choose");
        assert!(
            all_ops(f).iter().any(|o| matches!(o, Op::Phi { incomings } if incomings.len() == 2))
        );
    }

    #[test]
    fn test_while_loop_has_preheader_cond_exit() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "spin",
                          "params": {"list": [{"name": "n"}]},
                          "body": [{"kind": "while",
                                    "cond": {"kind": "call",
                                             "receiver": {"kind": "lvar", "name": "n"},
                                             "name": ">",
                                             "args": [{"kind": "int", "value": 0}]},
                                    "body": [{"kind": "assign",
                                              "target": {"kind": "lvar", "name": "n"},
                                              "value": {"kind": "call",
                                                        "receiver": {"kind": "lvar", "name": "n"},
                                                        "name": "-",
                                                        "args": [{"kind": "int", "value": 1}]}}]}]}]}"#,
        );
        let f = find(&p, "spin");
        let labels: Vec<&str> = f.blocks.iter().map(|b| b.label.as_str()).collect();
        assert!(labels.iter().any(|l| l.starts_with("preheader")));
        assert!(labels.iter().any(|l| l.starts_with("loopcond")));
        assert!(labels.iter().any(|l| l.starts_with("loopexit")));
    }

    #[test]
    fn test_required_keyword_emits_missing_check() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "greet",
                          "params": {"list": [{"name": "name", "label": "keyword"}]},
                          "body": [{"kind": "lvar", "name": "name"}]}]}"#,
        );
        let f = find(&p, "greet");
        assert!(f.variadic, "keyword functions use the variadic convention");
        let ops = all_ops(f);
        assert!(ops.iter().any(|o| matches!(o, Op::KwLookup { name, .. } if name == "name")));
        assert!(ops.iter().any(|o| matches!(o, Op::IsUndef(_))));
        let raises: Vec<_> = f
            .blocks
            .iter()
            .filter_map(|b| match &b.term {
                Terminator::Raise(RaiseKind::ArgumentError { message }) => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert!(raises.iter().any(|m| m.contains("missing keyword: :name")), "{:?}", raises);
    }

    #[test]
    fn test_case_in_without_else_raises() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "m",
                          "params": {"list": [{"name": "x"}]},
                          "body": [{"kind": "case_in",
                                    "subject": {"kind": "lvar", "name": "x"},
                                    "clauses": [{"pattern": {"kind": "type_test", "constant": "Integer"},
                                                 "body": [{"kind": "sym", "name": "int"}]}],
                                    "else_body": null}]}]}"#,
        );
        let f = find(&p, "m");
        assert!(f.blocks.iter().any(|b| matches!(
            b.term,
            Terminator::Raise(RaiseKind::NoMatchingPattern { .. })
        )));
        assert!(all_ops(f)
            .iter()
            .any(|o| matches!(o, Op::KindOf { class_name, .. } if class_name == "Integer")));
    }

    #[test]
    fn test_array_pattern_min_length_two() {
        // in [a, *rest, b]: requires length >= 2 and binds the middle slice
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "shape",
                          "params": {"list": [{"name": "x"}]},
                          "body": [{"kind": "case_in",
                                    "subject": {"kind": "lvar", "name": "x"},
                                    "clauses": [{"pattern": {"kind": "array_pat",
                                                             "pre": [{"kind": "capture", "name": "a"}],
                                                             "rest": {"name": "rest"},
                                                             "post": [{"kind": "capture", "name": "b"}]},
                                                 "body": [{"kind": "lvar", "name": "rest"}]}],
                                    "else_body": [{"kind": "nil"}]}]}]}"#,
        );
        let f = find(&p, "shape");
        let ops = all_ops(f);
        assert!(ops.iter().any(|o| matches!(o, Op::ConstInt(2))));
        assert!(ops.iter().any(|o| matches!(
            o,
            Op::ArraySlice { start: 1, drop_back: 1, .. }
        )));
        // tail element read from the back
        assert!(ops.iter().any(|o| matches!(o, Op::ArrayGet { index: -1, .. })));
    }

    #[test]
    fn test_begin_rescue_ensure_outlines_bodies() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "guarded", "params": {"list": []},
                          "body": [{"kind": "begin",
                                    "body": [{"kind": "int", "value": 1}],
                                    "rescues": [{"classes": ["ArgumentError"], "binder": "e",
                                                 "body": [{"kind": "int", "value": 2}]}],
                                    "else_body": [{"kind": "int", "value": 3}],
                                    "ensure_body": [{"kind": "int", "value": 4}]}]}]}"#,
        );
        let f = find(&p, "guarded");
        assert!(f.env_locals);
        let rescue = all_ops(f).into_iter().find_map(|o| match o {
            Op::Rescue { body_fn, arms, else_fn, ensure_fn, .. } => {
                Some((body_fn.clone(), arms.clone(), else_fn.clone(), ensure_fn.clone()))
            }
            _ => None,
        });
        let (body_fn, arms, else_fn, ensure_fn) = rescue.expect("rescue instruction");
        assert_eq!(arms.len(), 1);
        assert_eq!(arms[0].classes, vec!["ArgumentError"]);
        // every outlined function exists in the program
        assert!(p.function(&body_fn).is_some());
        assert!(p.function(&arms[0].handler_fn).is_some());
        assert!(p.function(&else_fn.unwrap()).is_some());
        assert!(p.function(&ensure_fn.unwrap()).is_some());
    }

    #[test]
    fn test_block_call_outlines_callback() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "run", "params": {"list": [{"name": "xs"}]},
                          "body": [{"kind": "call",
                                    "receiver": {"kind": "lvar", "name": "xs"},
                                    "name": "each",
                                    "args": [],
                                    "block": {"params": {"list": [{"name": "x"}]},
                                              "body": [{"kind": "lvar", "name": "x"}]}}]}]}"#,
        );
        let run = find(&p, "run");
        assert!(run.env_locals);
        let block_key = all_ops(run)
            .into_iter()
            .find_map(|o| match o {
                Op::CallMethod { block_fn: Some(k), .. } => Some(k.clone()),
                _ => None,
            })
            .expect("call with block");
        let cb = find(&p, &block_key);
        assert!(matches!(cb.kind, FnKind::BlockBody { .. }));
        assert!(cb.env_locals);
    }

    #[test]
    fn test_multi_assign_evaluates_once_and_slices() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "unpack", "params": {"list": [{"name": "v"}]},
                          "body": [{"kind": "multi_assign",
                                    "targets": [
                                      {"kind": "target", "node": {"kind": "lvar", "name": "a"}},
                                      {"kind": "splat", "name": "rest"},
                                      {"kind": "target", "node": {"kind": "lvar", "name": "c"}}],
                                    "value": {"kind": "lvar", "name": "v"}}]}]}"#,
        );
        let f = find(&p, "unpack");
        let ops = all_ops(f);
        assert_eq!(
            ops.iter().filter(|o| matches!(o, Op::ToArray(_))).count(),
            1,
            "value coerced exactly once"
        );
        assert!(ops.iter().any(|o| matches!(o, Op::ArrayGet { index: 0, .. })));
        assert!(ops.iter().any(|o| matches!(o, Op::ArraySlice { start: 1, drop_back: 1, .. })));
        assert!(ops.iter().any(|o| matches!(o, Op::ArrayGet { index: -1, .. })));
    }

    #[test]
    fn test_super_lowers_to_supercall() {
        let p = lower_src(
            r#"{"body": [{"kind": "class_def", "name": "Dog", "superclass": "Animal",
                          "body": [{"kind": "def", "name": "speak", "params": {"list": []},
                                    "body": [{"kind": "super_call", "args": [], "implicit": true}]}]}]}"#,
        );
        let f = find(&p, "Dog#speak");
        assert!(all_ops(f).iter().any(|o| matches!(o, Op::SuperCall { .. })));
    }

    #[test]
    fn test_fiber_new_and_yield_slot() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "gen", "params": {"list": []},
                          "body": [{"kind": "call",
                                    "receiver": {"kind": "const", "name": "Fiber"},
                                    "name": "new", "args": [],
                                    "block": {"params": {"list": []},
                                              "body": [{"kind": "call",
                                                        "receiver": {"kind": "const", "name": "Fiber"},
                                                        "name": "yield",
                                                        "args": [{"kind": "int", "value": 1}]}]}}]}]}"#,
        );
        let gen = find(&p, "gen");
        assert!(all_ops(gen).iter().any(|o| matches!(o, Op::FiberNew { .. })));
        let fiber_fn = p
            .functions
            .iter()
            .find(|f| matches!(f.kind, FnKind::FiberBody { .. }))
            .expect("fiber body function");
        let ops = all_ops(fiber_fn);
        assert!(ops.iter().any(|o| matches!(o, Op::FiberYield { .. })));
        // the yield result lands in a dedicated slot even though unnamed
        let root = find(&p, "gen");
        assert!(root.locals.iter().any(|l| l.name == "__fiber_resumed"));
    }

    #[test]
    fn test_compound_write_reads_then_calls_then_writes() {
        let p = lower_src(
            r#"{"body": [{"kind": "def", "name": "bump", "params": {"list": [{"name": "x"}]},
                          "body": [{"kind": "op_assign",
                                    "target": {"kind": "lvar", "name": "x"},
                                    "op": "+",
                                    "value": {"kind": "int", "value": 1}}]}]}"#,
        );
        let f = find(&p, "bump");
        let ops = all_ops(f);
        assert!(ops.iter().any(|o| matches!(o, Op::CallMethod { method, .. } if method == "+")));
        // read and write-back of the local
        assert!(ops.iter().filter(|o| matches!(o, Op::LoadLocal(_))).count() >= 1);
        assert!(ops.iter().filter(|o| matches!(o, Op::StoreLocal(..))).count() >= 1);
    }

    #[test]
    fn test_class_records_carry_structure() {
        let p = lower_src(
            r#"{"body": [{"kind": "class_def", "name": "Counter", "superclass": null,
                          "body": [
                            {"kind": "assign",
                             "target": {"kind": "cvar", "name": "@@count"},
                             "value": {"kind": "int", "value": 0}},
                            {"kind": "const_assign", "name": "MAX",
                             "value": {"kind": "int", "value": 100}},
                            {"kind": "def", "name": "tick", "params": {"list": []},
                             "body": [{"kind": "nil"}]}]}]}"#,
        );
        let c = &p.classes[0];
        assert_eq!(c.name, "Counter");
        assert_eq!(c.cvar_inits, vec![("@@count".to_string(), ConstValue::Int(0))]);
        assert_eq!(c.constants, vec![("MAX".to_string(), ConstValue::Int(100))]);
        assert_eq!(c.instance_methods, vec!["Counter#tick".to_string()]);
    }
}
