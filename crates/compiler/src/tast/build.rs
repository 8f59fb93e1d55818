//! Typed-AST builder
//!
//! One bottom-up walk over the CST. Types come from declarations (RBS
//! signatures, literal self-types) or propagation rules (operator overloads,
//! registry overload resolution, `self` typing); anything unresolved becomes
//! a fresh type variable for the HM inferrer. The walk also resolves
//! receiver kinds and dispatch strategies, merges re-opened classes, and
//! folds top-level statements into `__main__`.

use super::*;
use crate::cst::{self, Node, ParamLabel};
use crate::sig::SignatureRegistry;
use crate::types::Type;
use std::collections::HashMap;

/// Entry point: build a typed program from the parser's tree.
pub fn build(root: &cst::Root, registry: &SignatureRegistry) -> Result<TProgram, String> {
    let mut b = Builder::new(registry);
    b.predeclare(&root.body, None)?;
    b.walk_toplevel(&root.body)?;
    Ok(b.finish())
}

struct Builder<'r> {
    registry: &'r SignatureRegistry,
    var_counter: u32,
    functions: Vec<TFunction>,
    classes: Vec<TClassDecl>,
    class_index: HashMap<String, usize>,
    modules: Vec<TModuleDecl>,
    module_index: HashMap<String, usize>,
    /// Pre-declared signatures of user functions: key -> (params, ret)
    fn_sigs: HashMap<String, (Vec<Type>, Type)>,
    /// (owner-or-empty, ivar) -> type
    ivar_types: HashMap<(String, String), Type>,
    gvar_types: HashMap<String, Type>,
    cvar_types: HashMap<(String, String), Type>,
}

/// Lexical typing scope: a stack of local frames. Blocks push a frame but
/// read through to enclosing frames (closure capture).
struct Scope {
    frames: Vec<HashMap<String, Type>>,
    self_ty: Type,
    owner: Option<Owner>,
}

impl Scope {
    fn lookup(&self, name: &str) -> Option<&Type> {
        self.frames.iter().rev().find_map(|f| f.get(name))
    }

    /// First binding fixes a local's type slot. Re-binding with a different
    /// type is left to the inferrer, whose unifier reports the conflict the
    /// way the type checker would (`x = 1; x = "s"` is a type error).
    fn assign(&mut self, name: &str, ty: Type) {
        for frame in self.frames.iter_mut().rev() {
            if frame.contains_key(name) {
                return;
            }
        }
        self.frames.last_mut().unwrap().insert(name.to_string(), ty);
    }
}

impl<'r> Builder<'r> {
    fn new(registry: &'r SignatureRegistry) -> Builder<'r> {
        Builder {
            registry,
            var_counter: 0,
            functions: Vec::new(),
            classes: Vec::new(),
            class_index: HashMap::new(),
            modules: Vec::new(),
            module_index: HashMap::new(),
            fn_sigs: HashMap::new(),
            ivar_types: HashMap::new(),
            gvar_types: HashMap::new(),
            cvar_types: HashMap::new(),
        }
    }

    fn fresh(&mut self) -> Type {
        let t = Type::Var(format!("t{}", self.var_counter));
        self.var_counter += 1;
        t
    }

    fn finish(self) -> TProgram {
        TProgram {
            functions: self.functions,
            classes: self.classes,
            modules: self.modules,
            ivar_types: self.ivar_types,
            gvar_types: self.gvar_types,
            cvar_types: self.cvar_types,
        }
    }

    /// Merge-point typing inside the builder: identical types stay, unknown
    /// sides get a fresh variable for the inferrer to tie via a join
    /// constraint, and concrete mixes take the lattice join immediately.
    fn join_at_merge(&mut self, a: Type, b: Type) -> Type {
        if a == b {
            return a;
        }
        if a.has_var() || b.has_var() {
            return self.fresh();
        }
        Type::join(a, b)
    }

    // ---- pre-declaration pass ------------------------------------------

    /// Register every function signature before typing any body, so calls
    /// to later definitions resolve. Signatures come from the registry when
    /// declared, otherwise from fresh variables.
    fn predeclare(&mut self, body: &[Node], owner: Option<&str>) -> Result<(), String> {
        for node in body {
            match node {
                Node::Def { name, params, singleton, .. } => {
                    let key = function_key(owner, name, *singleton);
                    let declared = match owner {
                        Some(class) => self.declared_sig(class, name, *singleton),
                        None => self.declared_sig("Object", name, false),
                    };
                    let sig = match declared {
                        Some(s) => s,
                        None => {
                            let ps: Vec<Type> =
                                params.list.iter().map(|_| self.fresh()).collect();
                            let ret = self.fresh();
                            (ps, ret)
                        }
                    };
                    self.fn_sigs.insert(key, sig);
                }
                Node::ClassDef { name, body, .. } | Node::ModuleDef { name, body } => {
                    self.predeclare(body, Some(name))?;
                }
                Node::SingletonClass { body } => {
                    if let Some(class) = owner {
                        for n in body {
                            if let Node::Def { name, params, .. } = n {
                                let key = function_key(Some(class), name, true);
                                let sig = self
                                    .declared_sig(class, name, true)
                                    .unwrap_or_else(|| {
                                        (
                                            params.list.iter().map(|_| Type::Value).collect(),
                                            Type::Value,
                                        )
                                    });
                                self.fn_sigs.insert(key, sig);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn declared_sig(
        &self,
        class: &str,
        method: &str,
        singleton: bool,
    ) -> Option<(Vec<Type>, Type)> {
        let sig = self.registry.classes.get(class).and_then(|c| {
            let table = if singleton { &c.singleton_methods } else { &c.methods };
            table.get(method).and_then(|e| e.overloads.first())
        })?;
        let ret = if sig.returns_self {
            Type::Class { name: class.to_string(), args: vec![] }
        } else {
            sig.ret.clone()
        };
        Some((sig.params.clone(), ret))
    }

    // ---- top-level walk -------------------------------------------------

    fn walk_toplevel(&mut self, body: &[Node]) -> Result<(), String> {
        let mut main_body = Vec::new();
        let mut scope = Scope {
            frames: vec![HashMap::new()],
            self_ty: Type::Value,
            owner: None,
        };
        for node in body {
            match node {
                Node::Def { name, params, body, singleton } => {
                    if *singleton {
                        return Err(format!(
                            "Top-level singleton method '{}' is not supported",
                            name
                        ));
                    }
                    self.build_function(None, name, params, body, false)?;
                }
                Node::ClassDef { name, superclass, body } => {
                    self.build_class(name, superclass.as_deref(), body)?;
                }
                Node::ModuleDef { name, body } => {
                    self.build_module(name, body)?;
                }
                other => {
                    let e = self.type_expr(other, &mut scope)?;
                    main_body.push(e);
                }
            }
        }
        let ret_ty = main_body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil);
        self.functions.push(TFunction {
            key: "__main__".to_string(),
            name: "__main__".to_string(),
            owner: None,
            singleton: false,
            params: Vec::new(),
            body: main_body,
            ret_ty,
        });
        Ok(())
    }

    fn class_decl_mut(&mut self, name: &str) -> &mut TClassDecl {
        if let Some(&i) = self.class_index.get(name) {
            return &mut self.classes[i];
        }
        let i = self.classes.len();
        self.class_index.insert(name.to_string(), i);
        self.classes.push(TClassDecl {
            name: name.to_string(),
            ..TClassDecl::default()
        });
        &mut self.classes[i]
    }

    fn build_class(
        &mut self,
        name: &str,
        superclass: Option<&str>,
        body: &[Node],
    ) -> Result<(), String> {
        {
            let seen_before = self.class_index.contains_key(name);
            let decl = self.class_decl_mut(name);
            if seen_before {
                decl.reopened = true;
            }
            if let (Some(prev), Some(new)) = (&decl.superclass, superclass) {
                if prev != new {
                    return Err(format!(
                        "Class '{}' reopened with a different superclass ('{}' vs '{}')",
                        name, prev, new
                    ));
                }
            }
            if decl.superclass.is_none() {
                decl.superclass = superclass.map(str::to_string);
            }
        }

        // visibility mode toggled by bare `private` / `protected` / `public`
        let mut visibility = "public";
        let mut scope = Scope {
            frames: vec![HashMap::new()],
            self_ty: Type::Class { name: name.to_string(), args: vec![] },
            owner: Some(Owner::Class(name.to_string())),
        };

        for node in body {
            match node {
                Node::Def { name: m, params, body: mbody, singleton } => {
                    let key = self.build_function(Some(name), m, params, mbody, *singleton)?;
                    let decl = self.class_decl_mut(name);
                    if *singleton {
                        decl.singleton_methods.push(key);
                    } else {
                        decl.instance_methods.push(key.clone());
                        match visibility {
                            "private" => {
                                decl.private_methods.insert(m.clone());
                            }
                            "protected" => {
                                decl.protected_methods.insert(m.clone());
                            }
                            _ => {}
                        }
                    }
                }
                Node::SingletonClass { body: sbody } => {
                    for n in sbody {
                        if let Node::Def { name: m, params, body: mbody, .. } = n {
                            let key =
                                self.build_function(Some(name), m, params, mbody, true)?;
                            self.class_decl_mut(name).singleton_methods.push(key);
                        }
                    }
                }
                Node::AliasDecl { new_name, old_name } => {
                    self.class_decl_mut(name)
                        .aliases
                        .push((new_name.clone(), old_name.clone()));
                }
                Node::ConstAssign { name: cname, value } => {
                    let v = self.type_expr(value, &mut scope)?;
                    self.class_decl_mut(name).constants.push((cname.clone(), v));
                }
                Node::Assign { target, value } if matches!(**target, Node::Cvar { .. }) => {
                    let v = self.type_expr(value, &mut scope)?;
                    if let Node::Cvar { name: cv } = &**target {
                        self.cvar_types
                            .insert((name.to_string(), cv.clone()), v.ty.clone());
                        self.class_decl_mut(name).cvar_inits.push((cv.clone(), v));
                    }
                }
                Node::Call { receiver: None, name: call, args, .. } => {
                    match call.as_str() {
                        "private" | "protected" | "public" if args.is_empty() => {
                            visibility = match call.as_str() {
                                "private" => "private",
                                "protected" => "protected",
                                _ => "public",
                            };
                        }
                        "private" | "protected" => {
                            for a in args {
                                if let Node::Sym { name: m } = a {
                                    let decl = self.class_decl_mut(name);
                                    if call == "private" {
                                        decl.private_methods.insert(m.clone());
                                    } else {
                                        decl.protected_methods.insert(m.clone());
                                    }
                                }
                            }
                        }
                        "include" | "extend" | "prepend" => {
                            for a in args {
                                if let Node::Const { name: m } = a {
                                    let decl = self.class_decl_mut(name);
                                    match call.as_str() {
                                        "include" => decl.includes.push(m.clone()),
                                        "extend" => decl.extends.push(m.clone()),
                                        _ => decl.prepends.push(m.clone()),
                                    }
                                }
                            }
                        }
                        "attr_reader" | "attr_writer" | "attr_accessor" => {
                            self.build_attr_methods(name, call, args)?;
                        }
                        other => {
                            tracing::warn!(
                                class = %name,
                                call = %other,
                                "ignoring unsupported class-body statement"
                            );
                        }
                    }
                }
                other => {
                    tracing::warn!(
                        class = %name,
                        "ignoring unsupported class-body statement: {:?}",
                        std::mem::discriminant(other)
                    );
                }
            }
        }
        Ok(())
    }

    fn build_attr_methods(
        &mut self,
        class: &str,
        which: &str,
        args: &[Node],
    ) -> Result<(), String> {
        for a in args {
            let attr = match a {
                Node::Sym { name } => name.clone(),
                _ => continue,
            };
            let ivar_ty = self.ivar_type(Some(class), &attr);
            if which != "attr_writer" {
                let key = format!("{}#{}", class, attr);
                self.fn_sigs.insert(key.clone(), (vec![], ivar_ty.clone()));
                self.functions.push(TFunction {
                    key: key.clone(),
                    name: attr.clone(),
                    owner: Some(Owner::Class(class.to_string())),
                    singleton: false,
                    params: vec![],
                    body: vec![TExpr::new(
                        TExprKind::IvarGet(format!("@{}", attr)),
                        ivar_ty.clone(),
                    )],
                    ret_ty: ivar_ty.clone(),
                });
                self.class_decl_mut(class).instance_methods.push(key);
            }
            if which != "attr_reader" {
                let key = format!("{}#{}=", class, attr);
                self.fn_sigs
                    .insert(key.clone(), (vec![ivar_ty.clone()], ivar_ty.clone()));
                self.functions.push(TFunction {
                    key: key.clone(),
                    name: format!("{}=", attr),
                    owner: Some(Owner::Class(class.to_string())),
                    singleton: false,
                    params: vec![TParam {
                        name: "value".to_string(),
                        label: ParamLabel::Required,
                        ty: ivar_ty.clone(),
                        default: None,
                    }],
                    body: vec![TExpr::new(
                        TExprKind::Assign {
                            target: TTarget::Ivar(format!("@{}", attr)),
                            value: Box::new(TExpr::new(
                                TExprKind::LocalGet("value".to_string()),
                                ivar_ty.clone(),
                            )),
                        },
                        ivar_ty.clone(),
                    )],
                    ret_ty: ivar_ty.clone(),
                });
                self.class_decl_mut(class).instance_methods.push(key);
            }
        }
        Ok(())
    }

    fn build_module(&mut self, name: &str, body: &[Node]) -> Result<(), String> {
        if !self.module_index.contains_key(name) {
            self.module_index.insert(name.to_string(), self.modules.len());
            self.modules.push(TModuleDecl {
                name: name.to_string(),
                ..TModuleDecl::default()
            });
        }
        let mut scope = Scope {
            frames: vec![HashMap::new()],
            self_ty: Type::Value,
            owner: Some(Owner::Module(name.to_string())),
        };
        for node in body {
            match node {
                Node::Def { name: m, params, body: mbody, singleton } => {
                    let key = self.build_function_in_module(name, m, params, mbody, *singleton)?;
                    let i = self.module_index[name];
                    if *singleton {
                        self.modules[i].singleton_methods.push(key);
                    } else {
                        self.modules[i].instance_methods.push(key);
                    }
                }
                Node::ConstAssign { name: cname, value } => {
                    let v = self.type_expr(value, &mut scope)?;
                    let i = self.module_index[name];
                    self.modules[i].constants.push((cname.clone(), v));
                }
                other => {
                    tracing::warn!(
                        module = %name,
                        "ignoring unsupported module-body statement: {:?}",
                        std::mem::discriminant(other)
                    );
                }
            }
        }
        Ok(())
    }

    // ---- functions ------------------------------------------------------

    fn build_function(
        &mut self,
        owner: Option<&str>,
        name: &str,
        params: &cst::Params,
        body: &[Node],
        singleton: bool,
    ) -> Result<String, String> {
        let key = function_key(owner, name, singleton);
        let owner_enum = owner.map(|c| Owner::Class(c.to_string()));
        self.build_function_inner(key, name, owner_enum, params, body, singleton)
    }

    fn build_function_in_module(
        &mut self,
        module: &str,
        name: &str,
        params: &cst::Params,
        body: &[Node],
        singleton: bool,
    ) -> Result<String, String> {
        let key = function_key(Some(module), name, singleton);
        self.build_function_inner(
            key,
            name,
            Some(Owner::Module(module.to_string())),
            params,
            body,
            singleton,
        )
    }

    fn build_function_inner(
        &mut self,
        key: String,
        name: &str,
        owner: Option<Owner>,
        params: &cst::Params,
        body: &[Node],
        singleton: bool,
    ) -> Result<String, String> {
        let (sig_params, sig_ret) = self
            .fn_sigs
            .get(&key)
            .cloned()
            .unwrap_or_else(|| {
                (
                    params.list.iter().map(|_| Type::Value).collect(),
                    Type::Value,
                )
            });

        let self_ty = match &owner {
            Some(Owner::Class(c)) if !singleton => {
                if self.registry.is_native_class(c) {
                    Type::Native(c.clone())
                } else {
                    Type::Class { name: c.clone(), args: vec![] }
                }
            }
            _ => Type::Value,
        };

        let mut scope = Scope {
            frames: vec![HashMap::new()],
            self_ty,
            owner: owner.clone(),
        };

        let mut tparams = Vec::with_capacity(params.list.len());
        for (i, p) in params.list.iter().enumerate() {
            let ty = sig_params.get(i).cloned().unwrap_or_else(|| self.fresh());
            let default = match &p.default {
                Some(d) => Some(self.type_expr(d, &mut scope)?),
                None => None,
            };
            let ty = match p.label {
                ParamLabel::Rest => Type::Array,
                ParamLabel::KeywordRest => Type::Hash,
                _ => ty,
            };
            scope.frames[0].insert(p.name.clone(), ty.clone());
            tparams.push(TParam {
                name: p.name.clone(),
                label: p.label,
                ty,
                default,
            });
        }

        let mut tbody = Vec::with_capacity(body.len());
        for node in body {
            if matches!(node, Node::Def { .. }) {
                return Err(format!(
                    "Unsupported construct: nested method definition inside '{}'",
                    name
                ));
            }
            tbody.push(self.type_expr(node, &mut scope)?);
        }

        self.functions.push(TFunction {
            key: key.clone(),
            name: name.to_string(),
            owner,
            singleton,
            params: tparams,
            body: tbody,
            ret_ty: sig_ret,
        });
        Ok(key)
    }

    fn ivar_type(&mut self, owner: Option<&str>, attr: &str) -> Type {
        let owner_key = owner.unwrap_or("").to_string();
        let name = attr.trim_start_matches('@').to_string();
        if let Some(t) = self
            .ivar_types
            .get(&(owner_key.clone(), name.clone()))
            .cloned()
        {
            return t;
        }
        let declared = owner.and_then(|c| {
            self.registry.classes.get(c).and_then(|cs| {
                cs.ivars
                    .iter()
                    .find(|(n, _)| n.trim_start_matches('@') == name)
                    .map(|(_, t)| t.clone())
            })
        });
        let ty = declared.unwrap_or_else(|| self.fresh());
        self.ivar_types.insert((owner_key, name), ty.clone());
        ty
    }

    // ---- expression typing ---------------------------------------------

    fn type_body(&mut self, body: &[Node], scope: &mut Scope) -> Result<Vec<TExpr>, String> {
        body.iter().map(|n| self.type_expr(n, scope)).collect()
    }

    fn body_type(body: &[TExpr]) -> Type {
        body.last().map(|e| e.ty.clone()).unwrap_or(Type::Nil)
    }

    fn type_expr(&mut self, node: &Node, scope: &mut Scope) -> Result<TExpr, String> {
        match node {
            Node::Int { value } => Ok(TExpr::new(TExprKind::IntLit(*value), Type::Int)),
            Node::Float { value } => Ok(TExpr::new(TExprKind::FloatLit(*value), Type::Float)),
            Node::Str { value } => Ok(TExpr::new(TExprKind::StrLit(value.clone()), Type::Str)),
            Node::Sym { name } => Ok(TExpr::new(TExprKind::SymLit(name.clone()), Type::Symbol)),
            Node::True => Ok(TExpr::new(TExprKind::BoolLit(true), Type::Bool)),
            Node::False => Ok(TExpr::new(TExprKind::BoolLit(false), Type::Bool)),
            Node::Nil => Ok(TExpr::nil()),
            Node::SelfRef => Ok(TExpr::new(TExprKind::SelfRef, scope.self_ty.clone())),

            Node::Array { elements } => {
                let items = self.type_body(elements, scope)?;
                Ok(TExpr::new(TExprKind::ArrayLit(items), Type::Array))
            }
            Node::HashLit { pairs } => {
                let mut tpairs = Vec::with_capacity(pairs.len());
                for p in pairs {
                    tpairs.push((
                        self.type_expr(&p.key, scope)?,
                        self.type_expr(&p.value, scope)?,
                    ));
                }
                Ok(TExpr::new(TExprKind::HashLit(tpairs), Type::Hash))
            }
            Node::RangeLit { low, high, exclusive } => {
                let low = match low {
                    Some(l) => Some(Box::new(self.type_expr(l, scope)?)),
                    None => None,
                };
                let high = match high {
                    Some(h) => Some(Box::new(self.type_expr(h, scope)?)),
                    None => None,
                };
                Ok(TExpr::new(
                    TExprKind::RangeLit { low, high, exclusive: *exclusive },
                    Type::Range,
                ))
            }
            Node::RegexpLit { source } => Ok(TExpr::new(
                TExprKind::RegexpLit(source.clone()),
                Type::Regexp,
            )),

            Node::Lvar { name } => {
                let ty = scope
                    .lookup(name)
                    .cloned()
                    .unwrap_or_else(|| {
                        // unresolved name: placeholder for the inferrer
                        let t = self.fresh();
                        scope.assign(name, t.clone());
                        t
                    });
                Ok(TExpr::new(TExprKind::LocalGet(name.clone()), ty))
            }
            Node::Ivar { name } => {
                let owner = owner_class_name(&scope.owner);
                let ty = self.ivar_type(owner.as_deref(), name);
                Ok(TExpr::new(TExprKind::IvarGet(name.clone()), ty))
            }
            Node::Gvar { name } => {
                let ty = self
                    .gvar_types
                    .get(name)
                    .cloned()
                    .unwrap_or(Type::Value);
                Ok(TExpr::new(TExprKind::GvarGet(name.clone()), ty))
            }
            Node::Cvar { name } => {
                let owner = owner_class_name(&scope.owner).unwrap_or_default();
                let ty = self
                    .cvar_types
                    .get(&(owner, name.clone()))
                    .cloned()
                    .unwrap_or(Type::Value);
                Ok(TExpr::new(TExprKind::CvarGet(name.clone()), ty))
            }
            Node::Const { name } => {
                let ty = self.constant_type(name, scope);
                Ok(TExpr::new(TExprKind::ConstGet(name.clone()), ty))
            }

            Node::Assign { target, value } => {
                let v = self.type_expr(value, scope)?;
                let target = self.type_target(target, scope, &v.ty)?;
                let ty = v.ty.clone();
                Ok(TExpr::new(
                    TExprKind::Assign { target, value: Box::new(v) },
                    ty,
                ))
            }
            Node::OpAssign { target, op, value } => {
                let v = self.type_expr(value, scope)?;
                let current = self.target_read_type(target, scope)?;
                let result = match builtin_method_type(&current, op, &[v.ty.clone()]) {
                    Some(t) => t,
                    None => self.fresh(),
                };
                let target = self.type_target(target, scope, &result)?;
                Ok(TExpr::new(
                    TExprKind::OpAssign { target, op: op.clone(), value: Box::new(v) },
                    result,
                ))
            }
            Node::OrAssign { target, value } => {
                let v = self.type_expr(value, scope)?;
                let current = self.target_read_type(target, scope)?;
                let ty = self.join_at_merge(current, v.ty.clone());
                let target = self.type_target(target, scope, &ty)?;
                Ok(TExpr::new(
                    TExprKind::OrAssign { target, value: Box::new(v) },
                    ty,
                ))
            }
            Node::AndAssign { target, value } => {
                let v = self.type_expr(value, scope)?;
                let current = self.target_read_type(target, scope)?;
                let ty = self.join_at_merge(current, v.ty.clone());
                let target = self.type_target(target, scope, &ty)?;
                Ok(TExpr::new(
                    TExprKind::AndAssign { target, value: Box::new(v) },
                    ty,
                ))
            }
            Node::MultiAssign { targets, value } => {
                let v = self.type_expr(value, scope)?;
                let mut tts = Vec::with_capacity(targets.len());
                for t in targets {
                    match t {
                        cst::MlhsTarget::Target { node } => {
                            let tt = self.type_target(node, scope, &Type::Value)?;
                            tts.push(TMlhs::Target(tt));
                        }
                        cst::MlhsTarget::Splat { name } => {
                            if let Some(n) = name {
                                scope.assign(n, Type::Array);
                            }
                            tts.push(TMlhs::Splat(name.clone()));
                        }
                    }
                }
                let ty = v.ty.clone();
                Ok(TExpr::new(
                    TExprKind::MultiAssign { targets: tts, value: Box::new(v) },
                    ty,
                ))
            }
            Node::ConstAssign { name, value } => {
                let v = self.type_expr(value, scope)?;
                let ty = v.ty.clone();
                Ok(TExpr::new(
                    TExprKind::ConstAssign { name: name.clone(), value: Box::new(v) },
                    ty,
                ))
            }

            Node::Call { receiver, safe, name, args, kwargs, block } => {
                self.type_call(receiver.as_deref(), *safe, name, args, kwargs, block.as_deref(), scope)
            }
            Node::SuperCall { args, implicit } => {
                let targs = self.type_body(args, scope)?;
                let ty = self.fresh();
                Ok(TExpr::new(
                    TExprKind::SuperCall { args: targs, implicit: *implicit },
                    ty,
                ))
            }
            Node::YieldExpr { args } => {
                let targs = self.type_body(args, scope)?;
                let ty = self.fresh();
                Ok(TExpr::new(TExprKind::YieldExpr { args: targs }, ty))
            }
            Node::Lambda { params, body, lambda } => {
                let block = self.type_block(params, body, *lambda, scope)?;
                let ty = Type::Function {
                    params: block.params.iter().map(|p| p.ty.clone()).collect(),
                    ret: Box::new(Self::body_type(&block.body)),
                    may_raise: true,
                };
                Ok(TExpr::new(TExprKind::LambdaLit { block }, ty))
            }

            Node::And { lhs, rhs } => {
                let l = self.type_expr(lhs, scope)?;
                let r = self.type_expr(rhs, scope)?;
                let ty = self.join_at_merge(l.ty.clone(), r.ty.clone());
                Ok(TExpr::new(
                    TExprKind::And { lhs: Box::new(l), rhs: Box::new(r) },
                    ty,
                ))
            }
            Node::Or { lhs, rhs } => {
                let l = self.type_expr(lhs, scope)?;
                let r = self.type_expr(rhs, scope)?;
                let ty = self.join_at_merge(l.ty.clone(), r.ty.clone());
                Ok(TExpr::new(
                    TExprKind::Or { lhs: Box::new(l), rhs: Box::new(r) },
                    ty,
                ))
            }
            Node::NotExpr { value } => {
                let v = self.type_expr(value, scope)?;
                Ok(TExpr::new(TExprKind::Not(Box::new(v)), Type::Bool))
            }

            Node::If { cond, then_body, else_body } => {
                let c = self.type_expr(cond, scope)?;
                let t = self.type_body(then_body, scope)?;
                let e = self.type_body(else_body, scope)?;
                let ty = self.join_at_merge(Self::body_type(&t), Self::body_type(&e));
                Ok(TExpr::new(
                    TExprKind::If {
                        cond: Box::new(c),
                        then_body: t,
                        else_body: e,
                    },
                    ty,
                ))
            }
            Node::While { cond, body } | Node::Until { cond, body } => {
                let negated = matches!(node, Node::Until { .. });
                let c = self.type_expr(cond, scope)?;
                let b = self.type_body(body, scope)?;
                Ok(TExpr::new(
                    TExprKind::While { cond: Box::new(c), body: b, negated },
                    Type::Nil,
                ))
            }
            Node::CaseWhen { subject, clauses, else_body } => {
                self.desugar_case_when(subject.as_deref(), clauses, else_body, scope)
            }
            Node::CaseIn { subject, clauses, else_body } => {
                let s = self.type_expr(subject, scope)?;
                let mut tclauses = Vec::with_capacity(clauses.len());
                let mut ty = Type::Unit;
                for c in clauses {
                    self.bind_pattern_names(&c.pattern, scope);
                    let guard = match &c.guard {
                        Some(g) => Some(Box::new(self.type_expr(g, scope)?)),
                        None => None,
                    };
                    let body = self.type_body(&c.body, scope)?;
                    ty = self.join_at_merge(ty, Self::body_type(&body));
                    tclauses.push(TInClause { pattern: c.pattern.clone(), guard, body });
                }
                let telse = match else_body {
                    Some(e) => {
                        let b = self.type_body(e, scope)?;
                        ty = self.join_at_merge(ty, Self::body_type(&b));
                        Some(b)
                    }
                    None => None,
                };
                Ok(TExpr::new(
                    TExprKind::CaseIn {
                        subject: Box::new(s),
                        clauses: tclauses,
                        else_body: telse,
                    },
                    ty,
                ))
            }
            Node::Begin { body, rescues, else_body, ensure_body } => {
                let b = self.type_body(body, scope)?;
                let mut ty = Self::body_type(&b);
                let mut trs = Vec::with_capacity(rescues.len());
                for r in rescues {
                    if let Some(binder) = &r.binder {
                        let bty = r
                            .classes
                            .first()
                            .map(|c| Type::Class { name: c.clone(), args: vec![] })
                            .unwrap_or(Type::Value);
                        scope.assign(binder, bty);
                    }
                    let rbody = self.type_body(&r.body, scope)?;
                    ty = self.join_at_merge(ty, Self::body_type(&rbody));
                    trs.push(TRescue {
                        classes: r.classes.clone(),
                        binder: r.binder.clone(),
                        body: rbody,
                    });
                }
                let telse = self.type_body(else_body, scope)?;
                if !telse.is_empty() {
                    ty = self.join_at_merge(ty, Self::body_type(&telse));
                }
                let tens = self.type_body(ensure_body, scope)?;
                Ok(TExpr::new(
                    TExprKind::Begin {
                        body: b,
                        rescues: trs,
                        else_body: telse,
                        ensure_body: tens,
                    },
                    ty,
                ))
            }
            Node::Return { value } => {
                let v = match value {
                    Some(v) => Some(Box::new(self.type_expr(v, scope)?)),
                    None => None,
                };
                Ok(TExpr::new(TExprKind::Return(v), Type::Unit))
            }
            Node::Break { value } => {
                let v = match value {
                    Some(v) => Some(Box::new(self.type_expr(v, scope)?)),
                    None => None,
                };
                Ok(TExpr::new(TExprKind::Break(v), Type::Unit))
            }
            Node::Next { value } => {
                let v = match value {
                    Some(v) => Some(Box::new(self.type_expr(v, scope)?)),
                    None => None,
                };
                Ok(TExpr::new(TExprKind::Next(v), Type::Unit))
            }
            Node::Raise { args } => {
                let targs = self.type_body(args, scope)?;
                Ok(TExpr::new(TExprKind::Raise { args: targs }, Type::Unit))
            }

            Node::Def { name, .. } => Err(format!(
                "Unsupported construct: method definition '{}' in expression position",
                name
            )),
            Node::ClassDef { name, .. } => Err(format!(
                "Unsupported construct: class definition '{}' in expression position",
                name
            )),
            Node::ModuleDef { name, .. } => Err(format!(
                "Unsupported construct: module definition '{}' in expression position",
                name
            )),
            Node::SingletonClass { .. } => Err(
                "Unsupported construct: singleton class body in expression position".to_string(),
            ),
            Node::AliasDecl { .. } => {
                Err("Unsupported construct: alias outside a class body".to_string())
            }
        }
    }

    /// `case x when a, b ... else ... end` desugars into an `if` chain over
    /// `test === subject` calls, evaluating the subject once into a hidden
    /// local.
    fn desugar_case_when(
        &mut self,
        subject: Option<&Node>,
        clauses: &[cst::WhenClause],
        else_body: &[Node],
        scope: &mut Scope,
    ) -> Result<TExpr, String> {
        let subject_local = "__case_subject".to_string();
        let mut prelude: Option<TExpr> = None;
        if let Some(s) = subject {
            let sv = self.type_expr(s, scope)?;
            scope.assign(&subject_local, sv.ty.clone());
            let ty = sv.ty.clone();
            prelude = Some(TExpr::new(
                TExprKind::Assign {
                    target: TTarget::Local(subject_local.clone()),
                    value: Box::new(sv),
                },
                ty,
            ));
        }

        let mut chain: Vec<TExpr> = self.type_body(else_body, scope)?;
        for clause in clauses.iter().rev() {
            let mut cond: Option<TExpr> = None;
            for test in &clause.tests {
                let t = self.type_expr(test, scope)?;
                let one = if subject.is_some() {
                    let subj_ty = scope.lookup(&subject_local).cloned().unwrap_or(Type::Value);
                    TExpr::new(
                        TExprKind::Call {
                            receiver: Some(Box::new(t)),
                            recv_kind: ReceiverKind::Explicit,
                            method: "===".to_string(),
                            args: vec![TExpr::new(
                                TExprKind::LocalGet(subject_local.clone()),
                                subj_ty,
                            )],
                            kwargs: vec![],
                            block: None,
                            dispatch: Dispatch::Generic,
                        },
                        Type::Bool,
                    )
                } else {
                    t
                };
                cond = Some(match cond {
                    None => one,
                    Some(prev) => TExpr::new(
                        TExprKind::If {
                            cond: Box::new(prev),
                            then_body: vec![TExpr::new(TExprKind::BoolLit(true), Type::Bool)],
                            else_body: vec![one],
                        },
                        Type::Bool,
                    ),
                });
            }
            let body = self.type_body(&clause.body, scope)?;
            let ty = self.join_at_merge(Self::body_type(&body), Self::body_type(&chain));
            chain = vec![TExpr::new(
                TExprKind::If {
                    cond: Box::new(cond.ok_or("case clause with no tests")?),
                    then_body: body,
                    else_body: chain,
                },
                ty,
            )];
        }

        let ty = Self::body_type(&chain);
        let mut body = Vec::new();
        if let Some(p) = prelude {
            body.push(p);
        }
        body.append(&mut chain);
        // wrap in a no-op if so a single expression comes out
        if body.len() == 1 {
            Ok(body.pop().unwrap())
        } else {
            Ok(TExpr::new(
                TExprKind::If {
                    cond: Box::new(TExpr::new(TExprKind::BoolLit(true), Type::Bool)),
                    then_body: body,
                    else_body: vec![],
                },
                ty,
            ))
        }
    }

    /// Record the locals a pattern will bind so clause bodies see them.
    /// Bindings are typed from the pattern where possible.
    fn bind_pattern_names(&mut self, pattern: &cst::Pattern, scope: &mut Scope) {
        match pattern {
            cst::Pattern::Capture { pattern: inner, name } => {
                let ty = match inner.as_deref() {
                    Some(cst::Pattern::TypeTest { constant }) => {
                        Type::from_constant_name(constant)
                            .unwrap_or_else(|| Type::Class { name: constant.clone(), args: vec![] })
                    }
                    _ => Type::Value,
                };
                scope.assign(name, ty);
                if let Some(inner) = inner {
                    self.bind_pattern_names(inner, scope);
                }
            }
            cst::Pattern::ArrayPat { pre, rest, post } => {
                for p in pre.iter().chain(post.iter()) {
                    self.bind_pattern_names(p, scope);
                }
                if let Some(r) = rest {
                    if let Some(n) = &r.name {
                        scope.assign(n, Type::Array);
                    }
                }
            }
            cst::Pattern::HashPat { entries } => {
                for e in entries {
                    match &e.value {
                        Some(p) => self.bind_pattern_names(p, scope),
                        None => scope.assign(&e.key, Type::Value),
                    }
                }
            }
            cst::Pattern::Alt { alternatives } => {
                for p in alternatives {
                    self.bind_pattern_names(p, scope);
                }
            }
            _ => {}
        }
    }

    fn type_block(
        &mut self,
        params: &cst::Params,
        body: &[Node],
        is_lambda: bool,
        scope: &mut Scope,
    ) -> Result<TBlock, String> {
        scope.frames.push(HashMap::new());
        let mut tparams = Vec::with_capacity(params.list.len());
        for p in &params.list {
            let ty = self.fresh();
            scope
                .frames
                .last_mut()
                .unwrap()
                .insert(p.name.clone(), ty.clone());
            let default = match &p.default {
                Some(d) => Some(self.type_expr(d, scope)?),
                None => None,
            };
            tparams.push(TParam {
                name: p.name.clone(),
                label: p.label,
                ty,
                default,
            });
        }
        let tbody = self.type_body(body, scope)?;
        scope.frames.pop();
        Ok(TBlock { params: tparams, body: tbody, is_lambda })
    }

    fn type_target(
        &mut self,
        node: &Node,
        scope: &mut Scope,
        value_ty: &Type,
    ) -> Result<TTarget, String> {
        match node {
            Node::Lvar { name } => {
                scope.assign(name, value_ty.clone());
                Ok(TTarget::Local(name.clone()))
            }
            Node::Ivar { name } => {
                let owner = owner_class_name(&scope.owner);
                let key = (owner.unwrap_or_default(), name.trim_start_matches('@').to_string());
                self.ivar_types
                    .entry(key)
                    .or_insert_with(|| value_ty.clone());
                Ok(TTarget::Ivar(name.clone()))
            }
            Node::Gvar { name } => {
                self.gvar_types
                    .entry(name.clone())
                    .or_insert_with(|| value_ty.clone());
                Ok(TTarget::Gvar(name.clone()))
            }
            Node::Cvar { name } => {
                let owner = owner_class_name(&scope.owner).unwrap_or_default();
                self.cvar_types
                    .entry((owner, name.clone()))
                    .or_insert_with(|| value_ty.clone());
                Ok(TTarget::Cvar(name.clone()))
            }
            Node::Call { receiver: Some(r), name, args, .. } => {
                let recv = self.type_expr(r, scope)?;
                if name == "[]" {
                    let index = args
                        .first()
                        .ok_or("index assignment without an index")?;
                    let idx = self.type_expr(index, scope)?;
                    Ok(TTarget::Index { recv: Box::new(recv), index: Box::new(idx) })
                } else {
                    Ok(TTarget::Attr { recv: Box::new(recv), name: name.clone() })
                }
            }
            other => Err(format!(
                "Unsupported assignment target: {:?}",
                std::mem::discriminant(other)
            )),
        }
    }

    fn target_read_type(&mut self, node: &Node, scope: &mut Scope) -> Result<Type, String> {
        Ok(match node {
            Node::Lvar { name } => scope.lookup(name).cloned().unwrap_or(Type::Nil),
            Node::Ivar { name } => {
                let owner = owner_class_name(&scope.owner);
                self.ivar_type(owner.as_deref(), name)
            }
            Node::Gvar { name } => self.gvar_types.get(name).cloned().unwrap_or(Type::Nil),
            Node::Cvar { name } => {
                let owner = owner_class_name(&scope.owner).unwrap_or_default();
                self.cvar_types
                    .get(&(owner, name.clone()))
                    .cloned()
                    .unwrap_or(Type::Nil)
            }
            _ => Type::Value,
        })
    }

    fn constant_type(&self, name: &str, scope: &Scope) -> Type {
        // a constant with a declared type in the enclosing class or a module
        if let Some(owner) = owner_class_name(&scope.owner) {
            if let Some(cs) = self.registry.classes.get(&owner) {
                if let Some(t) = cs.constants.get(name) {
                    return t.clone();
                }
            }
        }
        for m in self.registry.modules.values() {
            if let Some(t) = m.constants.get(name) {
                return t.clone();
            }
        }
        // class references evaluate to the class object itself
        Type::Value
    }

    #[allow(clippy::too_many_arguments)]
    fn type_call(
        &mut self,
        receiver: Option<&Node>,
        safe: bool,
        name: &str,
        args: &[Node],
        kwargs: &[cst::KwArg],
        block: Option<&cst::BlockLiteral>,
        scope: &mut Scope,
    ) -> Result<TExpr, String> {
        let trecv = match receiver {
            Some(r) => Some(Box::new(self.type_expr(r, scope)?)),
            None => None,
        };
        let targs = self.type_body(args, scope)?;
        let mut tkwargs = Vec::with_capacity(kwargs.len());
        for k in kwargs {
            tkwargs.push((k.name.clone(), self.type_expr(&k.value, scope)?));
        }
        let tblock = match block {
            Some(b) => Some(self.type_block(&b.params, &b.body, false, scope)?),
            None => None,
        };
        let arg_tys: Vec<Type> = targs.iter().map(|a| a.ty.clone()).collect();

        let recv_kind = match (&trecv, safe) {
            (Some(_), true) => ReceiverKind::SafeNav,
            (Some(r), false) if matches!(r.kind, TExprKind::SelfRef) => ReceiverKind::SelfRecv,
            (Some(_), false) => ReceiverKind::Explicit,
            (None, _) => ReceiverKind::Implicit,
        };

        let (ty, dispatch) = self.resolve_call(trecv.as_deref(), recv_kind, name, &arg_tys, scope);

        let ty = if safe { Type::optional(ty) } else { ty };
        Ok(TExpr::new(
            TExprKind::Call {
                receiver: trecv,
                recv_kind,
                method: name.to_string(),
                args: targs,
                kwargs: tkwargs,
                block: tblock,
                dispatch,
            },
            ty,
        ))
    }

    fn resolve_call(
        &mut self,
        receiver: Option<&TExpr>,
        recv_kind: ReceiverKind,
        name: &str,
        arg_tys: &[Type],
        scope: &Scope,
    ) -> (Type, Dispatch) {
        match receiver {
            None => {
                // bare call: user function, self-method, or builtin
                if let Some((_, ret)) = self.fn_sigs.get(name) {
                    return (ret.clone(), Dispatch::Direct { key: name.to_string() });
                }
                if let Some(owner) = owner_class_name(&scope.owner) {
                    let key = function_key(Some(&owner), name, false);
                    if let Some((_, ret)) = self.fn_sigs.get(&key) {
                        return (ret.clone(), Dispatch::Direct { key });
                    }
                }
                if let Some(sig) = self.registry.resolve_function(name, arg_tys) {
                    return (sig.ret, Dispatch::Generic);
                }
                if let Some(t) = builtin_global_type(name) {
                    return (t, Dispatch::Generic);
                }
                (self.fresh(), Dispatch::Generic)
            }
            Some(recv) => {
                // `Const.new` and other class-object calls
                if let TExprKind::ConstGet(cname) = &recv.kind {
                    if name == "new" {
                        let inst = if self.registry.is_native_class(cname) {
                            Type::Native(cname.clone())
                        } else {
                            Type::Class { name: cname.clone(), args: vec![] }
                        };
                        return (inst, Dispatch::Generic);
                    }
                    let skey = function_key(Some(cname), name, true);
                    if let Some((_, ret)) = self.fn_sigs.get(&skey) {
                        // the class object is the receiver; dispatch through
                        // the host so `self` binds correctly
                        return (ret.clone(), Dispatch::Generic);
                    }
                    if let Some(sig) =
                        self.registry.resolve_overload(cname, name, true, &[], arg_tys)
                    {
                        return (sig.ret, Dispatch::Generic);
                    }
                    return (self.fresh(), Dispatch::Generic);
                }

                match &recv.ty {
                    Type::Native(class) => {
                        if let Some(symbol) = self.registry.cfunc_method(class, name, false) {
                            let ret = self
                                .registry
                                .resolve_overload(class, name, false, &[], arg_tys)
                                .map(|s| s.ret)
                                .unwrap_or(Type::Value);
                            return (
                                ret,
                                Dispatch::Cfunc { symbol: symbol.to_string() },
                            );
                        }
                        let vtable = self
                            .registry
                            .native_class_type(class)
                            .map(|d| d.annotations.vtable)
                            .unwrap_or(false);
                        if let Some(sig) =
                            self.registry.resolve_overload(class, name, false, &[], arg_tys)
                        {
                            return (
                                sig.ret,
                                Dispatch::Native { class: class.clone(), vtable },
                            );
                        }
                        // setter/getter fall through to field types
                        if let Some(def) = self.registry.native_class_type(class) {
                            let field = name.trim_end_matches('=');
                            if let Some((_, kind)) =
                                def.fields.iter().find(|(f, _)| f == field)
                            {
                                let t = field_type(kind);
                                return (t, Dispatch::Native { class: class.clone(), vtable });
                            }
                        }
                        tracing::warn!(
                            class = %class,
                            method = %name,
                            "no signature for native method; falling back to boxed dispatch"
                        );
                        (Type::Value, Dispatch::Generic)
                    }
                    Type::Class { name: class, args } => {
                        let key = function_key(Some(class), name, false);
                        if let Some((_, ret)) = self.fn_sigs.get(&key) {
                            // direct calls carry no receiver operand, so
                            // only self-calls bypass the host dispatch
                            if recv_kind == ReceiverKind::SelfRecv {
                                return (ret.clone(), Dispatch::Direct { key });
                            }
                            return (ret.clone(), Dispatch::Generic);
                        }
                        if let Some(sig) =
                            self.registry.resolve_overload(class, name, false, args, arg_tys)
                        {
                            return (sig.ret, Dispatch::Generic);
                        }
                        (self.fresh(), Dispatch::Generic)
                    }
                    recv_ty => {
                        if let Some(t) = builtin_method_type(recv_ty, name, arg_tys) {
                            (t, Dispatch::Generic)
                        } else {
                            (self.fresh(), Dispatch::Generic)
                        }
                    }
                }
            }
        }
    }
}

fn owner_class_name(owner: &Option<Owner>) -> Option<String> {
    match owner {
        Some(Owner::Class(c)) => Some(c.clone()),
        Some(Owner::Module(m)) => Some(m.clone()),
        None => None,
    }
}

fn field_type(kind: &crate::sig::FieldKind) -> Type {
    use crate::sig::FieldKind;
    match kind {
        FieldKind::Int64 => Type::Int,
        FieldKind::Float64 => Type::Float,
        FieldKind::Bool => Type::Bool,
        FieldKind::Value => Type::Value,
        FieldKind::Embedded(c) | FieldKind::Ref(c) => Type::Native(c.clone()),
    }
}

/// Key under which a function is stored in the program.
pub fn function_key(owner: Option<&str>, name: &str, singleton: bool) -> String {
    match owner {
        None => name.to_string(),
        Some(c) if singleton => format!("{}.{}", c, name),
        Some(c) => format!("{}#{}", c, name),
    }
}

/// Well-known result types of bare calls into the host library.
fn builtin_global_type(name: &str) -> Option<Type> {
    match name {
        "puts" | "print" | "pp" => Some(Type::Nil),
        "p" => Some(Type::Value),
        "gets" => Some(Type::optional(Type::Str)),
        "rand" => Some(Type::Float),
        "sleep" => Some(Type::Int),
        "require" | "require_relative" => Some(Type::Bool),
        "block_given?" => Some(Type::Bool),
        _ => None,
    }
}

/// The host language's well-known operator and method overloads for the
/// primitive lattice types. This is the propagation rule table of the
/// typed-AST builder; anything not covered becomes an inference variable.
pub fn builtin_method_type(recv: &Type, method: &str, args: &[Type]) -> Option<Type> {
    let arg0 = args.first();
    match recv {
        Type::Int => match method {
            "+" | "-" | "*" | "%" | "**" | "/" => match arg0 {
                Some(Type::Float) => Some(Type::Float),
                Some(Type::Int) => Some(Type::Int),
                Some(Type::Var(_)) => None,
                _ => Some(Type::Int),
            },
            "<" | "<=" | ">" | ">=" | "==" | "!=" | "zero?" | "positive?" | "negative?"
            | "even?" | "odd?" => Some(Type::Bool),
            "<=>" => Some(Type::Int),
            "&" | "|" | "^" | "<<" | ">>" | "abs" | "succ" | "pred" | "to_i" => Some(Type::Int),
            "to_f" => Some(Type::Float),
            "to_s" | "chr" | "inspect" => Some(Type::Str),
            "times" | "upto" | "downto" => Some(Type::Int),
            _ => None,
        },
        Type::Float => match method {
            "+" | "-" | "*" | "/" | "%" | "**" | "abs" | "to_f" => Some(Type::Float),
            "<" | "<=" | ">" | ">=" | "==" | "!=" | "nan?" | "infinite?" | "zero?" => {
                Some(Type::Bool)
            }
            "floor" | "ceil" | "round" | "to_i" | "truncate" => Some(Type::Int),
            "to_s" | "inspect" => Some(Type::Str),
            _ => None,
        },
        Type::Str => match method {
            "+" | "*" | "upcase" | "downcase" | "capitalize" | "strip" | "chomp" | "chop"
            | "reverse" | "to_s" | "inspect" | "concat" | "<<" | "gsub" | "sub" | "tr" => {
                Some(Type::Str)
            }
            "==" | "!=" | "<" | ">" | "<=" | ">=" | "empty?" | "include?" | "start_with?"
            | "end_with?" | "match?" => Some(Type::Bool),
            "length" | "size" | "bytesize" | "count" | "ord" | "to_i" | "hash" => Some(Type::Int),
            "to_f" => Some(Type::Float),
            "to_sym" | "intern" => Some(Type::Symbol),
            "split" | "chars" | "bytes" | "lines" => Some(Type::Array),
            "[]" | "slice" => Some(Type::optional(Type::Str)),
            "=~" | "index" | "rindex" => Some(Type::optional(Type::Int)),
            _ => None,
        },
        Type::Array => match method {
            "length" | "size" | "count" | "hash" => Some(Type::Int),
            "<<" | "push" | "append" | "concat" | "+" | "-" | "map" | "collect" | "select"
            | "filter" | "reject" | "sort" | "sort_by" | "reverse" | "flatten" | "compact"
            | "uniq" | "take" | "drop" | "to_a" | "each" | "each_with_index" | "zip"
            | "rotate" => Some(Type::Array),
            "empty?" | "include?" | "any?" | "all?" | "none?" => Some(Type::Bool),
            "join" | "inspect" | "to_s" => Some(Type::Str),
            "index" | "find_index" => Some(Type::optional(Type::Int)),
            "pop" | "shift" | "first" | "last" | "[]" | "sample" | "find" | "detect" | "min"
            | "max" | "sum" | "dig" => Some(Type::Value),
            _ => None,
        },
        Type::Hash => match method {
            "[]" | "fetch" | "delete" | "dig" => Some(Type::Value),
            "key?" | "has_key?" | "include?" | "member?" | "empty?" | "has_value?" => {
                Some(Type::Bool)
            }
            "keys" | "values" | "to_a" => Some(Type::Array),
            "size" | "length" | "count" => Some(Type::Int),
            "merge" | "each" | "to_h" => Some(Type::Hash),
            "inspect" | "to_s" => Some(Type::Str),
            _ => None,
        },
        Type::Range => match method {
            "each" | "step" => Some(Type::Range),
            "to_a" | "map" | "select" => Some(Type::Array),
            "include?" | "cover?" | "member?" => Some(Type::Bool),
            "sum" | "size" | "count" => Some(Type::Int),
            "first" | "last" | "min" | "max" => Some(Type::Value),
            _ => None,
        },
        Type::Symbol => match method {
            "to_s" | "inspect" => Some(Type::Str),
            "to_sym" => Some(Type::Symbol),
            "==" | "!=" => Some(Type::Bool),
            _ => None,
        },
        Type::Nil => match method {
            "nil?" => Some(Type::Bool),
            "to_s" | "inspect" => Some(Type::Str),
            "to_a" => Some(Type::Array),
            "to_i" => Some(Type::Int),
            _ => None,
        },
        Type::Bool => match method {
            "==" | "!=" | "&" | "|" | "^" | "!" => Some(Type::Bool),
            "to_s" | "inspect" => Some(Type::Str),
            _ => None,
        },
        _ => universal_method_type(recv, method),
    }
    .or_else(|| universal_method_type(recv, method))
}

fn universal_method_type(recv: &Type, method: &str) -> Option<Type> {
    match method {
        "nil?" | "==" | "!=" | "equal?" | "eql?" | "is_a?" | "kind_of?" | "instance_of?"
        | "respond_to?" | "frozen?" | "!" => Some(Type::Bool),
        "object_id" | "hash" => Some(Type::Int),
        "inspect" | "to_s" => Some(Type::Str),
        "freeze" | "dup" | "clone" | "tap" | "itself" => Some(recv.clone()),
        "class" => Some(Type::Value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::sig::SignatureRegistry;

    fn build_src(json: &str) -> TProgram {
        let root = Root::from_json(json).expect("CST should parse");
        let registry = SignatureRegistry::new();
        build(&root, &registry).expect("tast should build")
    }

    fn build_with_sigs(json: &str, rbs: &str) -> TProgram {
        let root = Root::from_json(json).expect("CST should parse");
        let mut registry = SignatureRegistry::new();
        registry.load_document(rbs, "test.rbs").unwrap();
        registry.finalize().unwrap();
        build(&root, &registry).expect("tast should build")
    }

    #[test]
    fn test_literal_self_types() {
        let p = build_src(r#"{"body": [{"kind": "int", "value": 1}, {"kind": "str", "value": "s"}]}"#);
        let main = p.functions.iter().find(|f| f.key == "__main__").unwrap();
        assert_eq!(main.body[0].ty, Type::Int);
        assert_eq!(main.body[1].ty, Type::Str);
        assert_eq!(main.ret_ty, Type::Str);
    }

    #[test]
    fn test_binary_operator_propagation() {
        // 1 + 2.0 => Float
        let p = build_src(
            r#"{"body": [{"kind": "call",
                          "receiver": {"kind": "int", "value": 1},
                          "name": "+",
                          "args": [{"kind": "float", "value": 2.0}]}]}"#,
        );
        let main = p.functions.iter().find(|f| f.key == "__main__").unwrap();
        assert_eq!(main.body[0].ty, Type::Float);
    }

    #[test]
    fn test_def_without_signature_gets_variables() {
        let p = build_src(
            r#"{"body": [{"kind": "def", "name": "add",
                          "params": {"list": [{"name": "a"}, {"name": "b"}]},
                          "body": [{"kind": "call",
                                    "receiver": {"kind": "lvar", "name": "a"},
                                    "name": "+",
                                    "args": [{"kind": "lvar", "name": "b"}]}]}]}"#,
        );
        let f = p.functions.iter().find(|f| f.key == "add").unwrap();
        assert!(matches!(f.params[0].ty, Type::Var(_)));
        assert!(matches!(f.ret_ty, Type::Var(_)));
    }

    #[test]
    fn test_def_with_signature_uses_declared_types() {
        let p = build_with_sigs(
            r#"{"body": [{"kind": "def", "name": "choose_int",
                          "params": {"list": [{"name": "c"}]},
                          "body": [{"kind": "if",
                                    "cond": {"kind": "lvar", "name": "c"},
                                    "then_body": [{"kind": "int", "value": 10}],
                                    "else_body": [{"kind": "int", "value": 20}]}]}]}"#,
            "class Object\n  def choose_int: (bool c) -> Integer\nend\n",
        );
        let f = p.functions.iter().find(|f| f.key == "choose_int").unwrap();
        assert_eq!(f.params[0].ty, Type::Bool);
        assert_eq!(f.ret_ty, Type::Int);
        // the if expression joins both arms to Integer
        assert_eq!(f.body[0].ty, Type::Int);
    }

    #[test]
    fn test_receiver_kinds() {
        let p = build_src(
            r#"{"body": [{"kind": "call",
                          "receiver": {"kind": "str", "value": "x"},
                          "safe": true, "name": "length", "args": []}]}"#,
        );
        let main = p.functions.iter().find(|f| f.key == "__main__").unwrap();
        match &main.body[0].kind {
            TExprKind::Call { recv_kind, .. } => {
                assert_eq!(*recv_kind, ReceiverKind::SafeNav);
            }
            other => panic!("expected call, got {:?}", other),
        }
        // safe navigation makes the result optional
        assert_eq!(main.body[0].ty, Type::optional(Type::Int));
    }

    #[test]
    fn test_class_structure_and_visibility() {
        let p = build_src(
            r#"{"body": [{"kind": "class_def", "name": "Dog", "superclass": "Animal",
                          "body": [
                            {"kind": "call", "receiver": null, "name": "include",
                             "args": [{"kind": "const", "name": "Walkable"}]},
                            {"kind": "def", "name": "speak", "params": {"list": []},
                             "body": [{"kind": "str", "value": "woof"}]},
                            {"kind": "call", "receiver": null, "name": "private", "args": []},
                            {"kind": "def", "name": "secret", "params": {"list": []},
                             "body": [{"kind": "nil"}]},
                            {"kind": "alias_decl", "new_name": "bark", "old_name": "speak"}
                          ]}]}"#,
        );
        let c = &p.classes[0];
        assert_eq!(c.name, "Dog");
        assert_eq!(c.superclass.as_deref(), Some("Animal"));
        assert_eq!(c.includes, vec!["Walkable"]);
        assert!(c.instance_methods.contains(&"Dog#speak".to_string()));
        assert!(c.private_methods.contains("secret"));
        assert_eq!(c.aliases, vec![("bark".to_string(), "speak".to_string())]);
        assert!(!c.reopened);
    }

    #[test]
    fn test_class_reopening_merges() {
        let p = build_src(
            r#"{"body": [
                 {"kind": "class_def", "name": "A", "superclass": null,
                  "body": [{"kind": "def", "name": "x", "params": {"list": []},
                            "body": [{"kind": "int", "value": 1}]}]},
                 {"kind": "class_def", "name": "A", "superclass": null,
                  "body": [{"kind": "def", "name": "y", "params": {"list": []},
                            "body": [{"kind": "int", "value": 2}]}]}]}"#,
        );
        assert_eq!(p.classes.len(), 1);
        let c = &p.classes[0];
        assert!(c.reopened);
        assert_eq!(c.instance_methods.len(), 2);
    }

    #[test]
    fn test_attr_accessor_synthesizes_methods() {
        let p = build_src(
            r#"{"body": [{"kind": "class_def", "name": "P", "superclass": null,
                          "body": [{"kind": "call", "receiver": null,
                                    "name": "attr_accessor",
                                    "args": [{"kind": "sym", "name": "x"}]}]}]}"#,
        );
        let c = &p.classes[0];
        assert!(c.instance_methods.contains(&"P#x".to_string()));
        assert!(c.instance_methods.contains(&"P#x=".to_string()));
        assert!(p.functions.iter().any(|f| f.key == "P#x="));
    }

    #[test]
    fn test_singleton_class_body() {
        let p = build_src(
            r#"{"body": [{"kind": "class_def", "name": "Reg", "superclass": null,
                          "body": [{"kind": "singleton_class",
                                    "body": [{"kind": "def", "name": "instance",
                                              "params": {"list": []},
                                              "body": [{"kind": "nil"}]}]}]}]}"#,
        );
        let c = &p.classes[0];
        assert_eq!(c.singleton_methods, vec!["Reg.instance".to_string()]);
    }

    #[test]
    fn test_case_when_desugars_to_if_chain() {
        let p = build_src(
            r#"{"body": [{"kind": "case_when",
                          "subject": {"kind": "int", "value": 3},
                          "clauses": [{"tests": [{"kind": "int", "value": 1}],
                                       "body": [{"kind": "str", "value": "one"}]}],
                          "else_body": [{"kind": "str", "value": "other"}]}]}"#,
        );
        let main = p.functions.iter().find(|f| f.key == "__main__").unwrap();
        // desugared: subject assignment + if chain with === dispatch
        match &main.body[0].kind {
            TExprKind::If { .. } => {}
            other => panic!("expected desugared if, got {:?}", other),
        }
    }

    #[test]
    fn test_native_receiver_uses_cfunc_dispatch() {
        let p = build_with_sigs(
            r#"{"body": [
                 {"kind": "def", "name": "go", "params": {"list": [{"name": "v"}]},
                  "body": [{"kind": "call",
                            "receiver": {"kind": "call",
                                         "receiver": {"kind": "const", "name": "Vector2"},
                                         "name": "new", "args": []},
                            "name": "norm", "args": []}]}]}"#,
            "%a{native}\nclass Vector2\n  @x: Float\n  %a{cfunc: name=kp_v2_norm}\n  def norm: () -> Float\nend\n",
        );
        let f = p.functions.iter().find(|f| f.key == "go").unwrap();
        match &f.body[0].kind {
            TExprKind::Call { dispatch, .. } => {
                assert_eq!(
                    *dispatch,
                    Dispatch::Cfunc { symbol: "kp_v2_norm".to_string() }
                );
            }
            other => panic!("expected call, got {:?}", other),
        }
        assert_eq!(f.body[0].ty, Type::Float);
    }
}
