//! Typed abstract syntax tree
//!
//! The typed-AST builder walks the parser's concrete tree once, bottom-up,
//! and produces this tree: every expression carries a type (declared,
//! propagated, or a fresh inference variable) and every call records its
//! receiver kind and dispatch strategy. The HM inferrer refines the
//! variables in place; the HIR builder consumes the result.

pub mod build;

use crate::cst;
use crate::types::Type;
use std::collections::{BTreeSet, HashMap};

/// A whole typed program: functions (methods, top-level defs, `__main__`),
/// class structure, and module structure. The variable-type maps share
/// inference variables with the expression tree, so applying the inferrer's
/// substitution refines both in lockstep.
#[derive(Debug, Default)]
pub struct TProgram {
    pub functions: Vec<TFunction>,
    pub classes: Vec<TClassDecl>,
    pub modules: Vec<TModuleDecl>,
    /// (owning class or "", ivar name without `@`) -> type
    pub ivar_types: HashMap<(String, String), Type>,
    pub gvar_types: HashMap<String, Type>,
    /// (owning class, cvar name) -> type
    pub cvar_types: HashMap<(String, String), Type>,
}

/// Who owns a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Class(String),
    Module(String),
}

/// One typed function. Method functions are keyed `Class#name` /
/// `Class.name`; top-level functions by bare name; the top-level statement
/// sequence compiles into `__main__`.
#[derive(Debug)]
pub struct TFunction {
    /// Unique key of this function in the program
    pub key: String,
    /// Source-level method or function name
    pub name: String,
    pub owner: Option<Owner>,
    pub singleton: bool,
    pub params: Vec<TParam>,
    pub body: Vec<TExpr>,
    pub ret_ty: Type,
}

#[derive(Debug, Clone)]
pub struct TParam {
    pub name: String,
    pub label: cst::ParamLabel,
    pub ty: Type,
    pub default: Option<TExpr>,
}

/// Class structure gathered from (possibly several) `class` bodies.
#[derive(Debug, Default)]
pub struct TClassDecl {
    pub name: String,
    pub superclass: Option<String>,
    /// Function keys in definition order
    pub instance_methods: Vec<String>,
    pub singleton_methods: Vec<String>,
    pub includes: Vec<String>,
    pub extends: Vec<String>,
    pub prepends: Vec<String>,
    /// new name -> old name
    pub aliases: Vec<(String, String)>,
    pub constants: Vec<(String, TExpr)>,
    pub cvar_inits: Vec<(String, TExpr)>,
    pub private_methods: BTreeSet<String>,
    pub protected_methods: BTreeSet<String>,
    /// A later `class Foo` body re-opened an already-seen class
    pub reopened: bool,
}

/// Module structure; like a class minus superclass.
#[derive(Debug, Default)]
pub struct TModuleDecl {
    pub name: String,
    pub instance_methods: Vec<String>,
    pub singleton_methods: Vec<String>,
    pub constants: Vec<(String, TExpr)>,
}

/// How a call names its receiver; safe navigation and operator overload
/// emission depend on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    /// Explicit `self.m`
    SelfRecv,
    /// `expr.m`
    Explicit,
    /// Bare `m` — self call or top-level function
    Implicit,
    /// `expr&.m`
    SafeNav,
}

/// Dispatch strategy resolved from the signature registry. Selected once;
/// the emitter does not renegotiate it.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// `rb_funcallv` through the host
    Generic,
    /// Call to a function compiled in this unit, by program key
    Direct { key: String },
    /// Struct-aware call on a native class; through the vtable when flagged
    Native { class: String, vtable: bool },
    /// Direct C-level call, no wrapper
    Cfunc { symbol: String },
}

/// An assignable place, kept structured so compound writes can evaluate
/// their receiver exactly once during HIR lowering.
#[derive(Debug, Clone)]
pub enum TTarget {
    Local(String),
    Ivar(String),
    Gvar(String),
    Cvar(String),
    /// `recv.name = v`
    Attr { recv: Box<TExpr>, name: String },
    /// `recv[index] = v`
    Index { recv: Box<TExpr>, index: Box<TExpr> },
}

/// A multiple-assignment left-hand-side element.
#[derive(Debug, Clone)]
pub enum TMlhs {
    Target(TTarget),
    /// `*rest`; None discards
    Splat(Option<String>),
}

/// A block literal: `{ |x| ... }` / `do ... end` / lambda body.
#[derive(Debug, Clone)]
pub struct TBlock {
    pub params: Vec<TParam>,
    pub body: Vec<TExpr>,
    /// Strict arity (`->`/`lambda`) vs lenient (`proc`, plain blocks)
    pub is_lambda: bool,
}

/// One typed `rescue` clause.
#[derive(Debug, Clone)]
pub struct TRescue {
    pub classes: Vec<String>,
    pub binder: Option<String>,
    pub body: Vec<TExpr>,
}

/// One typed `in` clause.
#[derive(Debug, Clone)]
pub struct TInClause {
    pub pattern: cst::Pattern,
    pub guard: Option<Box<TExpr>>,
    pub body: Vec<TExpr>,
}

/// A typed expression.
#[derive(Debug, Clone)]
pub struct TExpr {
    pub kind: TExprKind,
    pub ty: Type,
}

impl TExpr {
    pub fn new(kind: TExprKind, ty: Type) -> TExpr {
        TExpr { kind, ty }
    }

    pub fn nil() -> TExpr {
        TExpr::new(TExprKind::NilLit, Type::Nil)
    }
}

#[derive(Debug, Clone)]
pub enum TExprKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    SymLit(String),
    BoolLit(bool),
    NilLit,
    SelfRef,
    ArrayLit(Vec<TExpr>),
    HashLit(Vec<(TExpr, TExpr)>),
    RangeLit {
        low: Option<Box<TExpr>>,
        high: Option<Box<TExpr>>,
        exclusive: bool,
    },
    RegexpLit(String),

    LocalGet(String),
    IvarGet(String),
    GvarGet(String),
    CvarGet(String),
    ConstGet(String),

    Assign {
        target: TTarget,
        value: Box<TExpr>,
    },
    /// `x op= e` with receiver evaluated once at lowering time
    OpAssign {
        target: TTarget,
        op: String,
        value: Box<TExpr>,
    },
    /// `x ||= e`
    OrAssign {
        target: TTarget,
        value: Box<TExpr>,
    },
    /// `x &&= e`
    AndAssign {
        target: TTarget,
        value: Box<TExpr>,
    },
    MultiAssign {
        targets: Vec<TMlhs>,
        value: Box<TExpr>,
    },
    ConstAssign {
        name: String,
        value: Box<TExpr>,
    },

    Call {
        receiver: Option<Box<TExpr>>,
        recv_kind: ReceiverKind,
        method: String,
        args: Vec<TExpr>,
        kwargs: Vec<(String, TExpr)>,
        block: Option<TBlock>,
        dispatch: Dispatch,
    },
    SuperCall {
        args: Vec<TExpr>,
        implicit: bool,
    },
    YieldExpr {
        args: Vec<TExpr>,
    },
    LambdaLit {
        block: TBlock,
    },

    And {
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Or {
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Not(Box<TExpr>),

    If {
        cond: Box<TExpr>,
        then_body: Vec<TExpr>,
        else_body: Vec<TExpr>,
    },
    While {
        cond: Box<TExpr>,
        body: Vec<TExpr>,
        /// true for `until`
        negated: bool,
    },
    CaseIn {
        subject: Box<TExpr>,
        clauses: Vec<TInClause>,
        else_body: Option<Vec<TExpr>>,
    },
    Begin {
        body: Vec<TExpr>,
        rescues: Vec<TRescue>,
        else_body: Vec<TExpr>,
        ensure_body: Vec<TExpr>,
    },
    Return(Option<Box<TExpr>>),
    Break(Option<Box<TExpr>>),
    Next(Option<Box<TExpr>>),
    Raise {
        args: Vec<TExpr>,
    },
}

/// Rewrite every type in the program with `f`; used by the inferrer to
/// apply its final substitution.
pub fn map_types(program: &mut TProgram, f: &impl Fn(&Type) -> Type) {
    for func in &mut program.functions {
        func.ret_ty = f(&func.ret_ty);
        for p in &mut func.params {
            p.ty = f(&p.ty);
            if let Some(d) = &mut p.default {
                map_expr_types(d, f);
            }
        }
        for e in &mut func.body {
            map_expr_types(e, f);
        }
    }
    for class in &mut program.classes {
        for (_, e) in &mut class.constants {
            map_expr_types(e, f);
        }
        for (_, e) in &mut class.cvar_inits {
            map_expr_types(e, f);
        }
    }
    for module in &mut program.modules {
        for (_, e) in &mut module.constants {
            map_expr_types(e, f);
        }
    }
    for t in program.ivar_types.values_mut() {
        *t = f(t);
    }
    for t in program.gvar_types.values_mut() {
        *t = f(t);
    }
    for t in program.cvar_types.values_mut() {
        *t = f(t);
    }
}

fn map_target_types(t: &mut TTarget, f: &impl Fn(&Type) -> Type) {
    match t {
        TTarget::Attr { recv, .. } => map_expr_types(recv, f),
        TTarget::Index { recv, index } => {
            map_expr_types(recv, f);
            map_expr_types(index, f);
        }
        _ => {}
    }
}

fn map_expr_types(e: &mut TExpr, f: &impl Fn(&Type) -> Type) {
    e.ty = f(&e.ty);
    let each = |list: &mut Vec<TExpr>, f: &dyn Fn(&Type) -> Type| {
        for e in list {
            map_expr_types(e, &f);
        }
    };
    match &mut e.kind {
        TExprKind::ArrayLit(items) => each(items, f),
        TExprKind::HashLit(pairs) => {
            for (k, v) in pairs {
                map_expr_types(k, f);
                map_expr_types(v, f);
            }
        }
        TExprKind::RangeLit { low, high, .. } => {
            if let Some(l) = low {
                map_expr_types(l, f);
            }
            if let Some(h) = high {
                map_expr_types(h, f);
            }
        }
        TExprKind::Assign { target, value }
        | TExprKind::OpAssign { target, value, .. }
        | TExprKind::OrAssign { target, value }
        | TExprKind::AndAssign { target, value } => {
            map_target_types(target, f);
            map_expr_types(value, f);
        }
        TExprKind::MultiAssign { targets, value } => {
            for t in targets {
                if let TMlhs::Target(t) = t {
                    map_target_types(t, f);
                }
            }
            map_expr_types(value, f);
        }
        TExprKind::ConstAssign { value, .. } => map_expr_types(value, f),
        TExprKind::Call { receiver, args, kwargs, block, .. } => {
            if let Some(r) = receiver {
                map_expr_types(r, f);
            }
            each(args, f);
            for (_, v) in kwargs {
                map_expr_types(v, f);
            }
            if let Some(b) = block {
                for p in &mut b.params {
                    p.ty = f(&p.ty);
                }
                each(&mut b.body, f);
            }
        }
        TExprKind::SuperCall { args, .. } | TExprKind::YieldExpr { args } => each(args, f),
        TExprKind::LambdaLit { block } => {
            for p in &mut block.params {
                p.ty = f(&p.ty);
            }
            each(&mut block.body, f);
        }
        TExprKind::And { lhs, rhs } | TExprKind::Or { lhs, rhs } => {
            map_expr_types(lhs, f);
            map_expr_types(rhs, f);
        }
        TExprKind::Not(v) => map_expr_types(v, f),
        TExprKind::If { cond, then_body, else_body } => {
            map_expr_types(cond, f);
            each(then_body, f);
            each(else_body, f);
        }
        TExprKind::While { cond, body, .. } => {
            map_expr_types(cond, f);
            each(body, f);
        }
        TExprKind::CaseIn { subject, clauses, else_body } => {
            map_expr_types(subject, f);
            for c in clauses {
                if let Some(g) = &mut c.guard {
                    map_expr_types(g, f);
                }
                each(&mut c.body, f);
            }
            if let Some(e) = else_body {
                each(e, f);
            }
        }
        TExprKind::Begin { body, rescues, else_body, ensure_body } => {
            each(body, f);
            for r in rescues {
                each(&mut r.body, f);
            }
            each(else_body, f);
            each(ensure_body, f);
        }
        TExprKind::Return(v) | TExprKind::Break(v) | TExprKind::Next(v) => {
            if let Some(v) = v {
                map_expr_types(v, f);
            }
        }
        TExprKind::Raise { args } => each(args, f),
        _ => {}
    }
}
