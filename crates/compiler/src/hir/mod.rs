//! Typed HIR — the block-structured intermediate representation
//!
//! A program is a tuple of functions, classes, and modules. Each function
//! holds an ordered list of basic blocks; each block holds straight-line
//! instructions plus exactly one terminator. Every instruction produces a
//! value (possibly `void`) with a computed type label that the emitter uses
//! to decide boxing.
//!
//! Lowering introduces outlined functions for block bodies, protected
//! regions, and fiber bodies; a function that outlines anything promotes all
//! of its locals into a shared environment array so the outlined callbacks
//! observe mutation (see `env_locals`).

pub mod lower;
pub mod pretty;
pub mod validate;

use crate::types::Type;
use std::collections::{BTreeSet, HashMap};

pub type ValueId = u32;
pub type LocalId = usize;

/// Slots appended after the locals in a shared environment array:
/// return flag, return value, completed flag, self.
pub const ENV_RESERVED: usize = 4;
pub const ENV_RET_FLAG: usize = 0;
pub const ENV_RET_VAL: usize = 1;
pub const ENV_COMPLETED: usize = 2;
pub const ENV_SELF: usize = 3;

/// A compiled program.
#[derive(Debug, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub classes: Vec<ClassRecord>,
    pub modules: Vec<ModuleRecord>,
}

impl Program {
    pub fn function(&self, key: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.key == key)
    }

    pub fn function_mut(&mut self, key: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.key == key)
    }
}

/// A literal constant registered at initialization time (class body
/// constants, class-variable initial values).
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Bool(bool),
    Nil,
}

/// Structure of one class, merged across re-opened bodies.
#[derive(Debug, Default, Clone)]
pub struct ClassRecord {
    pub name: String,
    pub superclass: Option<String>,
    /// Function keys, in definition order
    pub instance_methods: Vec<String>,
    pub singleton_methods: Vec<String>,
    pub includes: Vec<String>,
    pub extends: Vec<String>,
    pub prepends: Vec<String>,
    /// new name -> old name
    pub aliases: Vec<(String, String)>,
    pub constants: Vec<(String, ConstValue)>,
    pub cvar_inits: Vec<(String, ConstValue)>,
    pub private_methods: BTreeSet<String>,
    pub protected_methods: BTreeSet<String>,
    pub reopened: bool,
}

/// Structure of one module.
#[derive(Debug, Default, Clone)]
pub struct ModuleRecord {
    pub name: String,
    pub instance_methods: Vec<String>,
    pub singleton_methods: Vec<String>,
    pub constants: Vec<(String, ConstValue)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FnOwner {
    Class(String),
    Module(String),
}

/// Why a function exists; outlined bodies carry their parent's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FnKind {
    Plain,
    /// Block/lambda callback: (yielded value, env) -> value
    BlockBody { parent: String },
    /// Protected body of a begin/rescue: (env) -> value
    ProtectedBody { parent: String },
    /// Rescue handler: (env, exception) -> value
    RescueHandler { parent: String },
    /// `else` body of a begin, run only on the no-exception path
    ElseBody { parent: String },
    /// Ensure body: (env) -> value
    EnsureBody { parent: String },
    /// Fiber body callback
    FiberBody { parent: String },
}

/// How one parameter binds, mirrored from the source parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Required,
    /// Optional positional; wrapper passes the undef sentinel when absent
    Optional,
    Rest,
    Keyword,
    KeywordOptional,
    KeywordRest,
    Block,
}

#[derive(Debug, Clone)]
pub struct FnParam {
    pub name: String,
    pub kind: ParamKind,
    pub ty: Type,
    /// Local slot this parameter spills into
    pub local: LocalId,
}

#[derive(Debug, Clone)]
pub struct LocalDecl {
    pub name: String,
    pub ty: Type,
}

/// One compiled function.
#[derive(Debug)]
pub struct Function {
    /// Program-unique key (`add`, `Dog#speak`, `Counter.instance`, …)
    pub key: String,
    /// Ruby-visible name
    pub name: String,
    pub owner: Option<FnOwner>,
    pub singleton: bool,
    pub kind: FnKind,
    pub params: Vec<FnParam>,
    /// Strict-arity lambda vs lenient proc (block bodies only)
    pub is_lambda: bool,
    /// Variadic C convention: registered with arity -1
    pub variadic: bool,
    pub locals: Vec<LocalDecl>,
    /// Result slot written by `return` paths; read in the epilogue
    pub ret_slot: LocalId,
    /// Locals live in a shared environment array (function outlines bodies,
    /// or is itself an outlined body sharing its parent's frame)
    pub env_locals: bool,
    pub ret_ty: Type,
    pub blocks: Vec<Block>,
    pub entry: String,
}

impl Function {
    pub fn block(&self, label: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.label == label)
    }

    /// Total instruction count across all blocks (inliner candidate size).
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// The type labels of every value defined in this function.
    pub fn value_types(&self) -> HashMap<ValueId, Type> {
        let mut map = HashMap::new();
        for b in &self.blocks {
            for i in &b.instrs {
                map.insert(i.dst, i.ty.clone());
            }
        }
        map
    }
}

/// A basic block: ordered instructions plus exactly one terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub label: String,
    pub instrs: Vec<Instr>,
    pub term: Terminator,
}

/// One SSA-style instruction. `dst` is defined by this instruction; `ty` is
/// the computed type label of the produced value.
#[derive(Debug, Clone)]
pub struct Instr {
    pub dst: ValueId,
    pub op: Op,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub enum Op {
    // literals
    ConstInt(i64),
    ConstFloat(f64),
    ConstStr(String),
    ConstSym(String),
    ConstBool(bool),
    ConstNil,
    SelfVal,

    // variables
    LoadLocal(LocalId),
    StoreLocal(LocalId, ValueId),
    LoadEnv(usize),
    StoreEnv(usize, ValueId),
    LoadGvar(String),
    StoreGvar(String, ValueId),
    LoadIvar(String),
    StoreIvar(String, ValueId),
    LoadCvar(String),
    StoreCvar(String, ValueId),
    LoadConst(String),
    StoreConst(String, ValueId),

    // aggregates
    ArrayNew(Vec<ValueId>),
    HashNew(Vec<(ValueId, ValueId)>),
    RangeNew {
        low: ValueId,
        high: ValueId,
        exclusive: bool,
    },
    RegexpNew(String),

    // calls
    CallMethod {
        recv: Option<ValueId>,
        method: String,
        args: Vec<ValueId>,
        kwargs: Vec<(String, ValueId)>,
        block_fn: Option<String>,
        safe: bool,
    },
    /// Direct call to a function compiled in this unit
    CallFn {
        key: String,
        args: Vec<ValueId>,
    },
    SuperCall {
        args: Vec<ValueId>,
    },
    /// Struct-aware dispatch on a native class
    NativeCall {
        class: String,
        method: String,
        recv: ValueId,
        args: Vec<ValueId>,
        vtable: bool,
    },
    /// Direct C-level call (`cfunc` annotation)
    CfuncCall {
        symbol: String,
        recv: ValueId,
        args: Vec<ValueId>,
    },

    // closures / fibers
    ProcNew {
        body_fn: String,
        is_lambda: bool,
    },
    YieldBlock {
        args: Vec<ValueId>,
    },
    FiberNew {
        body_fn: String,
    },
    FiberYield {
        args: Vec<ValueId>,
    },

    // pattern / shape support
    KindOf {
        value: ValueId,
        class_name: String,
    },
    ValueEq {
        lhs: ValueId,
        rhs: ValueId,
    },
    ArrayLen(ValueId),
    ArrayGet {
        ary: ValueId,
        index: i64,
    },
    /// `rb_ary_subseq(ary, start, len)` where `len = length - start - drop_back`
    ArraySlice {
        ary: ValueId,
        start: i64,
        drop_back: i64,
    },
    ToArray(ValueId),
    HashHasKey {
        hash: ValueId,
        key: String,
    },
    HashGetSym {
        hash: ValueId,
        key: String,
    },

    // keyword-argument plumbing
    KwLookup {
        hash: ValueId,
        name: String,
    },
    IsUndef(ValueId),

    // exception regions
    Rescue {
        body_fn: String,
        arms: Vec<RescueArm>,
        else_fn: Option<String>,
        ensure_fn: Option<String>,
        /// Env index of this region's completed flag, set by the protected
        /// body on normal completion; gates the `else` path
        completed_slot: usize,
    },

    /// Merge of straight-line branch values; promoted to an unboxed scalar
    /// phi when all incoming types agree
    Phi {
        incomings: Vec<(String, ValueId)>,
    },
}

/// One rescue arm: exception class names tested in order, and the outlined
/// handler that runs when one matches.
#[derive(Debug, Clone)]
pub struct RescueArm {
    pub classes: Vec<String>,
    pub handler_fn: String,
}

#[derive(Debug, Clone)]
pub enum Terminator {
    Jump(String),
    Branch {
        cond: ValueId,
        then_label: String,
        else_label: String,
    },
    Return(ValueId),
    Raise(RaiseKind),
}

#[derive(Debug, Clone)]
pub enum RaiseKind {
    /// `raise expr`
    Value(ValueId),
    /// Bare `raise` inside a handler: re-raise the current exception
    Rethrow,
    /// Required keyword missing, wrong arity, …
    ArgumentError { message: String },
    /// `case/in` fell through without an `else` arm
    NoMatchingPattern { value: ValueId },
}

impl Op {
    /// Values read by this instruction, for dominance checking and the
    /// loop-invariant hoister.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Op::StoreLocal(_, v)
            | Op::StoreEnv(_, v)
            | Op::StoreGvar(_, v)
            | Op::StoreIvar(_, v)
            | Op::StoreCvar(_, v)
            | Op::StoreConst(_, v)
            | Op::IsUndef(v)
            | Op::ToArray(v)
            | Op::ArrayLen(v) => vec![*v],
            Op::ArrayGet { ary, .. } | Op::ArraySlice { ary, .. } => vec![*ary],
            Op::HashHasKey { hash, .. }
            | Op::HashGetSym { hash, .. }
            | Op::KwLookup { hash, .. } => vec![*hash],
            Op::KindOf { value, .. } => vec![*value],
            Op::ValueEq { lhs, rhs } => vec![*lhs, *rhs],
            Op::ArrayNew(items) => items.clone(),
            Op::HashNew(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            Op::RangeNew { low, high, .. } => vec![*low, *high],
            Op::CallMethod { recv, args, kwargs, .. } => {
                let mut out: Vec<ValueId> = recv.iter().copied().collect();
                out.extend(args);
                out.extend(kwargs.iter().map(|(_, v)| *v));
                out
            }
            Op::CallFn { args, .. }
            | Op::SuperCall { args }
            | Op::YieldBlock { args }
            | Op::FiberYield { args } => args.clone(),
            Op::NativeCall { recv, args, .. } | Op::CfuncCall { recv, args, .. } => {
                let mut out = vec![*recv];
                out.extend(args);
                out
            }
            Op::Phi { incomings } => incomings.iter().map(|(_, v)| *v).collect(),
            _ => Vec::new(),
        }
    }

    /// True when the operation cannot observe or cause side effects; the
    /// loop-invariant hoister only moves these.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Op::ConstInt(_)
                | Op::ConstFloat(_)
                | Op::ConstStr(_)
                | Op::ConstSym(_)
                | Op::ConstBool(_)
                | Op::ConstNil
                | Op::SelfVal
                | Op::ArrayLen(_)
                | Op::KindOf { .. }
                | Op::IsUndef(_)
        )
    }
}

/// Mangle a program function key into a valid LLVM/C identifier.
///
/// Ruby method names may contain `?`, `!`, `=`, operators, and the key
/// separators `#` and `.`; all are escaped with underscore encodings.
pub fn mangle(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 8);
    for c in key.chars() {
        match c {
            '#' => out.push_str("_i_"),
            '.' => out.push_str("_s_"),
            '?' => out.push_str("_Q_"),
            '!' => out.push_str("_BANG_"),
            '=' => out.push_str("_EQ_"),
            '<' => out.push_str("_LT_"),
            '>' => out.push_str("_GT_"),
            '+' => out.push_str("_PLUS_"),
            '-' => out.push_str("_MINUS_"),
            '*' => out.push_str("_STAR_"),
            '/' => out.push_str("_SLASH_"),
            '%' => out.push_str("_PCT_"),
            '[' => out.push_str("_LB_"),
            ']' => out.push_str("_RB_"),
            '@' => out.push_str("_AT_"),
            '&' => out.push_str("_AMP_"),
            '|' => out.push_str("_PIPE_"),
            '^' => out.push_str("_CARET_"),
            '~' => out.push_str("_TILDE_"),
            ':' => out.push('_'),
            '_' | '$' => out.push(c),
            c if c.is_alphanumeric() => out.push(c),
            c => out.push_str(&format!("_x{:02X}_", c as u32)),
        }
    }
    out
}

/// Emitted symbol of a compiled function.
pub fn symbol_for(key: &str) -> String {
    format!("kp_{}", mangle(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mangle_method_keys() {
        assert_eq!(mangle("add"), "add");
        assert_eq!(mangle("Dog#speak"), "Dog_i_speak");
        assert_eq!(mangle("Counter.instance"), "Counter_s_instance");
        assert_eq!(mangle("empty?"), "empty_Q_");
        assert_eq!(mangle("x="), "x_EQ_");
        assert_eq!(mangle("Geo::Point#norm"), "Geo__Point_i_norm");
    }

    #[test]
    fn test_symbol_prefix() {
        assert_eq!(symbol_for("Dog#speak"), "kp_Dog_i_speak");
    }

    #[test]
    fn test_operands_of_call() {
        let op = Op::CallMethod {
            recv: Some(1),
            method: "+".into(),
            args: vec![2],
            kwargs: vec![("k".into(), 3)],
            block_fn: None,
            safe: false,
        };
        assert_eq!(op.operands(), vec![1, 2, 3]);
    }

    #[test]
    fn test_purity_allowlist() {
        assert!(Op::ConstInt(1).is_pure());
        assert!(Op::ArrayLen(0).is_pure());
        assert!(!Op::CallMethod {
            recv: None,
            method: "puts".into(),
            args: vec![],
            kwargs: vec![],
            block_fn: None,
            safe: false,
        }
        .is_pure());
        assert!(!Op::StoreLocal(0, 1).is_pure());
    }
}
