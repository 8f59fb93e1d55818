//! LLVM IR emission
//!
//! Walks the HIR and produces textual LLVM IR against the host
//! interpreter's C API (see [`runtime`]). Values carry a representation:
//! boxed `VALUE`, raw `i64`, raw `double`, or `i1`. Instruction results
//! whose HIR type is an unboxed scalar are normalized to the raw
//! representation eagerly and re-boxed lazily at host-API boundaries, so
//! arithmetic between typed values compiles to plain machine instructions.
//!
//! Functions whose parameters and return are all unboxed scalars get a
//! raw-ABI `_impl` definition plus a boxed wrapper; direct calls from
//! typed call sites target the impl and skip boxing entirely.

pub mod instr;
pub mod regions;
pub mod runtime;

use crate::hir::*;
use crate::sig::SignatureRegistry;
use crate::types::Type;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

/// How a value is materialized in the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr {
    /// Host VALUE (i64 at this ABI)
    Boxed,
    /// Raw machine integer
    I64,
    /// Raw double
    F64,
    /// Raw condition bit
    I1,
}

impl Repr {
    pub fn llvm(self) -> &'static str {
        match self {
            Repr::Boxed | Repr::I64 => "i64",
            Repr::F64 => "double",
            Repr::I1 => "i1",
        }
    }

    /// The natural representation of a HIR type.
    pub fn of(ty: &Type) -> Repr {
        match ty {
            Type::Int => Repr::I64,
            Type::Float => Repr::F64,
            Type::Bool => Repr::I1,
            _ => Repr::Boxed,
        }
    }
}

/// An emitted value: a full operand string (`%t3` or an immediate) plus its
/// representation.
#[derive(Debug, Clone)]
pub struct EVal {
    pub name: String,
    pub repr: Repr,
}

impl EVal {
    pub fn new(name: impl Into<String>, repr: Repr) -> EVal {
        EVal { name: name.into(), repr }
    }
}

/// ABI summary of one compiled function.
#[derive(Debug, Clone)]
struct FnAbi {
    symbol: String,
    /// Local slots of the ABI parameters, in ABI order (excludes keyword
    /// params, which are read out of the kwargs hash)
    abi_params: Vec<LocalId>,
    /// A raw-scalar `_impl` version exists
    has_impl: bool,
    impl_reprs: Vec<Repr>,
    impl_ret: Repr,
}

pub struct EmitOptions {
    pub profile: bool,
    pub module_name: String,
}

/// Emit the whole program as one LLVM module.
pub fn emit(
    program: &Program,
    registry: &SignatureRegistry,
    opts: &EmitOptions,
) -> Result<String, String> {
    let mut e = Emitter::new(program, registry, opts.profile);
    e.collect_sigs();
    for f in &program.functions {
        e.emit_function(f)?;
    }
    Ok(e.assemble(&opts.module_name))
}

pub struct Emitter<'a> {
    pub program: &'a Program,
    pub registry: &'a SignatureRegistry,
    pub profile: bool,

    pub body: String,
    pub globals: String,
    pub aux: String,
    /// extra external declarations discovered during emission (cfunc
    /// symbols, shim accessors)
    pub extra_decls: BTreeSet<String>,

    tmp: usize,
    str_n: usize,
    pub region_n: usize,
    string_consts: HashMap<String, (String, usize)>,
    sigs: HashMap<String, FnAbi>,

    // per-function state
    pub vals: HashMap<ValueId, EVal>,
    phi_ins: HashMap<(ValueId, String), EVal>,
    phi_demands: HashMap<String, Vec<(ValueId, ValueId, Repr)>>,
    /// The LLVM label currently being appended to; mid-block splits
    /// (division guards) move it, and phi predecessors must follow
    pub cur_actual: String,
    /// HIR block label -> final LLVM label of that block's tail
    pub block_actual: HashMap<String, String>,
    pub cur_env: Option<String>,
    pub cur_self: String,
    pub cur_fn: Option<&'a Function>,
    cur_ret: Repr,
    prof_t0: Option<String>,
    locals_reprs: Vec<Repr>,
}

impl<'a> Emitter<'a> {
    pub fn new(program: &'a Program, registry: &'a SignatureRegistry, profile: bool) -> Self {
        Emitter {
            program,
            registry,
            profile,
            body: String::new(),
            globals: String::new(),
            aux: String::new(),
            extra_decls: BTreeSet::new(),
            tmp: 0,
            str_n: 0,
            region_n: 0,
            string_consts: HashMap::new(),
            sigs: HashMap::new(),
            vals: HashMap::new(),
            phi_ins: HashMap::new(),
            phi_demands: HashMap::new(),
            cur_env: None,
            cur_self: "%self".to_string(),
            cur_fn: None,
            cur_ret: Repr::Boxed,
            prof_t0: None,
            locals_reprs: Vec::new(),
            cur_actual: String::new(),
            block_actual: HashMap::new(),
        }
    }

    /// Begin a fresh LLVM label mid-block (guard splits); subsequent
    /// instructions land there and phi predecessors follow.
    pub fn split_to(&mut self, label: String) {
        self.label(&label);
        self.cur_actual = label;
    }

    // ---- small helpers --------------------------------------------------

    pub fn fresh(&mut self) -> String {
        let n = self.tmp;
        self.tmp += 1;
        format!("%t{}", n)
    }

    pub fn line(&mut self, s: &str) {
        self.body.push_str("  ");
        self.body.push_str(s);
        self.body.push('\n');
    }

    pub fn label(&mut self, l: &str) {
        let _ = writeln!(self.body, "{}:", l);
    }

    /// Intern a C string literal; returns `(global name, byte length)`.
    pub fn string_global(&mut self, content: &str) -> String {
        if let Some((name, _)) = self.string_consts.get(content) {
            return name.clone();
        }
        let name = format!("@.str.{}", self.str_n);
        self.str_n += 1;
        let bytes = content.as_bytes();
        let mut escaped = String::with_capacity(bytes.len() * 2);
        for &b in bytes {
            match b {
                b'"' | b'\\' => escaped.push_str(&format!("\\{:02X}", b)),
                0x20..=0x7e => escaped.push(b as char),
                _ => escaped.push_str(&format!("\\{:02X}", b)),
            }
        }
        let len = bytes.len() + 1;
        let _ = writeln!(
            self.globals,
            "{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
            name, len, escaped
        );
        self.string_consts
            .insert(content.to_string(), (name.clone(), len));
        name
    }

    /// `rb_intern` of a name, as an i64 ID value.
    pub fn intern(&mut self, name: &str) -> String {
        let g = self.string_global(name);
        let t = self.fresh();
        self.line(&format!("{} = call i64 @rb_intern(ptr {})", t, g));
        t
    }

    /// Convert a value to the requested representation, emitting the
    /// box/unbox or numeric conversion it takes.
    pub fn coerce(&mut self, v: &EVal, want: Repr) -> EVal {
        if v.repr == want {
            return v.clone();
        }
        let t = self.fresh();
        match (v.repr, want) {
            (Repr::I64, Repr::Boxed) => {
                self.line(&format!("{} = call i64 @rb_ll2inum(i64 {})", t, v.name));
            }
            (Repr::F64, Repr::Boxed) => {
                self.line(&format!("{} = call i64 @rb_float_new(double {})", t, v.name));
            }
            (Repr::I1, Repr::Boxed) => {
                self.line(&format!(
                    "{} = select i1 {}, i64 {}, i64 {}",
                    t,
                    v.name,
                    runtime::QTRUE,
                    runtime::QFALSE
                ));
            }
            (Repr::Boxed, Repr::I64) => {
                self.line(&format!("{} = call i64 @rb_num2ll(i64 {})", t, v.name));
            }
            (Repr::Boxed, Repr::F64) => {
                self.line(&format!("{} = call double @rb_num2dbl(i64 {})", t, v.name));
            }
            (Repr::Boxed, Repr::I1) => {
                let m = self.fresh();
                self.line(&format!("{} = and i64 {}, -9", m, v.name));
                self.line(&format!("{} = icmp ne i64 {}, 0", t, m));
            }
            (Repr::I64, Repr::F64) => {
                self.line(&format!("{} = sitofp i64 {} to double", t, v.name));
            }
            (Repr::F64, Repr::I64) => {
                self.line(&format!("{} = fptosi double {} to i64", t, v.name));
            }
            (Repr::I1, Repr::I64) => {
                self.line(&format!("{} = zext i1 {} to i64", t, v.name));
            }
            (Repr::I64, Repr::I1) => {
                self.line(&format!("{} = icmp ne i64 {}, 0", t, v.name));
            }
            (Repr::I1, Repr::F64) => {
                let i = self.coerce(v, Repr::I64);
                let t2 = self.fresh();
                self.line(&format!("{} = sitofp i64 {} to double", t2, i.name));
                return EVal::new(t2, Repr::F64);
            }
            (Repr::F64, Repr::I1) => {
                // floats are always truthy in the host language
                return EVal::new("true", Repr::I1);
            }
            _ => unreachable!(),
        }
        EVal::new(t, want)
    }

    /// Truthiness of a value as an i1 (host semantics: only false and nil
    /// are falsy).
    pub fn truthy(&mut self, v: &EVal) -> String {
        match v.repr {
            Repr::I1 => v.name.clone(),
            Repr::I64 => {
                // a raw integer is a number: always truthy
                "true".to_string()
            }
            Repr::F64 => "true".to_string(),
            Repr::Boxed => self.coerce(v, Repr::I1).name,
        }
    }

    /// Spill boxed values into the function's argv scratch buffer (a
    /// single entry-block alloca, reused by every call site in turn).
    pub fn argv_array(&mut self, vals: &[EVal]) -> String {
        let arr = "%argvbuf".to_string();
        for (i, v) in vals.iter().enumerate() {
            let boxed = self.coerce(v, Repr::Boxed);
            let slot = self.fresh();
            self.line(&format!(
                "{} = getelementptr i64, ptr {}, i64 {}",
                slot, arr, i
            ));
            self.line(&format!("store i64 {}, ptr {}", boxed.name, slot));
        }
        arr
    }

    /// Largest argv any instruction in the function needs.
    fn max_argv(f: &Function) -> usize {
        let mut max = 1usize;
        for b in &f.blocks {
            for i in &b.instrs {
                let n = match &i.op {
                    Op::CallMethod { args, kwargs, .. } => {
                        args.len() + usize::from(!kwargs.is_empty())
                    }
                    Op::SuperCall { args }
                    | Op::YieldBlock { args }
                    | Op::FiberYield { args } => args.len(),
                    Op::ArrayNew(items) => items.len(),
                    _ => 0,
                };
                max = max.max(n);
            }
        }
        max
    }

    pub fn value(&self, id: ValueId) -> Result<EVal, String> {
        self.vals
            .get(&id)
            .cloned()
            .ok_or_else(|| format!("emitter: value %{} has no definition", id))
    }

    pub fn set_value(&mut self, id: ValueId, v: EVal) {
        self.vals.insert(id, v);
    }

    /// Resolve a (possibly `::`-qualified) constant at runtime.
    pub fn const_get(&mut self, path: &str) -> String {
        let mut cur = {
            let t = self.fresh();
            self.line(&format!("{} = load i64, ptr @rb_cObject", t));
            t
        };
        for part in path.split("::") {
            let id = self.intern(part);
            let t = self.fresh();
            self.line(&format!(
                "{} = call i64 @rb_const_get(i64 {}, i64 {})",
                t, cur, id
            ));
            cur = t;
        }
        cur
    }

    // ---- signatures -----------------------------------------------------

    fn collect_sigs(&mut self) {
        for f in &self.program.functions {
            let abi_params: Vec<LocalId> = f
                .params
                .iter()
                .filter(|p| {
                    !matches!(p.kind, ParamKind::Keyword | ParamKind::KeywordOptional)
                })
                .map(|p| p.local)
                .collect();
            // raw-ABI candidates carry no `self`, so nothing in the body may
            // need it
            let all_scalar = f.kind == FnKind::Plain
                && !f.env_locals
                && !f.variadic
                && !f.params.is_empty()
                && f.params.iter().all(|p| {
                    p.kind == ParamKind::Required && p.ty.is_unboxed_scalar()
                })
                && f.ret_ty.is_unboxed_scalar()
                && !Self::body_uses_self(f);
            let impl_reprs = f.params.iter().map(|p| Repr::of(&p.ty)).collect();
            self.sigs.insert(
                f.key.clone(),
                FnAbi {
                    symbol: symbol_for(&f.key),
                    abi_params,
                    has_impl: all_scalar,
                    impl_reprs,
                    impl_ret: Repr::of(&f.ret_ty),
                },
            );
        }

        // a raw-ABI function may only direct-call other raw-ABI functions
        // (boxed callees take self); demote to a fixpoint
        let mut changed = true;
        while changed {
            changed = false;
            for f in &self.program.functions {
                if !self.sigs.get(&f.key).map(|s| s.has_impl).unwrap_or(false) {
                    continue;
                }
                let calls_boxed = f.blocks.iter().flat_map(|b| b.instrs.iter()).any(|i| {
                    matches!(
                        &i.op,
                        Op::CallFn { key, .. }
                            if !self.sigs.get(key).map(|s| s.has_impl).unwrap_or(false)
                    )
                });
                if calls_boxed {
                    self.sigs.get_mut(&f.key).unwrap().has_impl = false;
                    changed = true;
                }
            }
        }
    }

    /// Does any instruction need the current `self` value?
    fn body_uses_self(f: &Function) -> bool {
        f.blocks.iter().flat_map(|b| b.instrs.iter()).any(|i| {
            matches!(
                &i.op,
                Op::SelfVal
                    | Op::LoadIvar(_)
                    | Op::StoreIvar(..)
                    | Op::LoadCvar(_)
                    | Op::StoreCvar(..)
                    | Op::SuperCall { .. }
                    | Op::YieldBlock { .. }
                    | Op::CallMethod { recv: None, .. }
            )
        })
    }

    pub fn fn_symbol(&self, key: &str) -> Option<String> {
        self.sigs.get(key).map(|s| s.symbol.clone())
    }

    /// ABI of a direct-call target, from the collected signature table (the
    /// single source of truth for impl-version eligibility).
    pub(super) fn callee_abi(&self, key: &str) -> Option<(String, bool, Vec<Repr>, Repr)> {
        self.sigs.get(key).map(|s| {
            (
                s.symbol.clone(),
                s.has_impl,
                s.impl_reprs.clone(),
                s.impl_ret,
            )
        })
    }

    // ---- function emission ----------------------------------------------

    fn emit_function(&mut self, f: &'a Function) -> Result<(), String> {
        if let Some(sig) = self.sigs.get(&f.key).cloned() {
            if sig.has_impl {
                self.emit_body(f, true)?;
                self.emit_impl_wrapper(f, &sig)?;
                return Ok(());
            }
        }
        self.emit_body(f, false)
    }

    /// The boxed wrapper of a raw-ABI function: unbox, call the impl, box.
    fn emit_impl_wrapper(&mut self, f: &Function, sig: &FnAbi) -> Result<(), String> {
        self.tmp = 0;
        let params: Vec<String> = (0..sig.abi_params.len())
            .map(|i| format!("i64 %a{}", i))
            .collect();
        let _ = writeln!(
            self.body,
            "define i64 @{}(i64 %self, {}) {{",
            sig.symbol,
            params.join(", ")
        );
        let mut raw_args = Vec::with_capacity(sig.abi_params.len());
        for (i, repr) in sig.impl_reprs.iter().enumerate() {
            let v = EVal::new(format!("%a{}", i), Repr::Boxed);
            raw_args.push(self.coerce(&v, *repr));
        }
        let args: Vec<String> = raw_args
            .iter()
            .map(|a| format!("{} {}", a.repr.llvm(), a.name))
            .collect();
        let t = self.fresh();
        self.line(&format!(
            "{} = call {} @{}_impl({})",
            t,
            sig.impl_ret.llvm(),
            sig.symbol,
            args.join(", ")
        ));
        let boxed = self.coerce(&EVal::new(t, sig.impl_ret), Repr::Boxed);
        self.line(&format!("ret i64 {}", boxed.name));
        self.body.push_str("}\n\n");
        Ok(())
    }

    fn emit_body(&mut self, f: &'a Function, raw_abi: bool) -> Result<(), String> {
        self.tmp = 0;
        self.vals.clear();
        self.phi_ins.clear();
        self.phi_demands.clear();
        self.block_actual.clear();
        self.cur_fn = Some(f);
        self.prof_t0 = None;
        let sig = self
            .sigs
            .get(&f.key)
            .cloned()
            .ok_or_else(|| format!("emitter: no signature for '{}'", f.key))?;
        self.cur_ret = if raw_abi { sig.impl_ret } else { Repr::Boxed };

        // pre-scan phi demands: each predecessor converts its incoming
        // value to the phi's representation before jumping
        for b in &f.blocks {
            for i in &b.instrs {
                if let Op::Phi { incomings } = &i.op {
                    let want = Repr::of(&i.ty);
                    for (pred, v) in incomings {
                        self.phi_demands
                            .entry(pred.clone())
                            .or_default()
                            .push((i.dst, *v, want));
                    }
                }
            }
        }

        self.emit_signature_line(f, &sig, raw_abi);
        self.line(&format!("%argvbuf = alloca i64, i64 {}", Self::max_argv(f)));
        self.emit_prologue(f, &sig, raw_abi)?;
        self.line(&format!("br label %bb_{}", f.entry));

        for b in &f.blocks {
            self.label(&format!("bb_{}", b.label));
            self.cur_actual = format!("bb_{}", b.label);
            for i in &b.instrs {
                self.emit_instr(f, i)?;
            }
            // phi-input conversions run in the predecessor, just before
            // its terminator
            if let Some(demands) = self.phi_demands.get(&b.label).cloned() {
                for (phi, v, want) in demands {
                    let val = self.value(v)?;
                    let conv = self.coerce(&val, want);
                    self.phi_ins.insert((phi, b.label.clone()), conv);
                }
            }
            self.block_actual
                .insert(b.label.clone(), self.cur_actual.clone());
            self.emit_terminator(f, &b.term)?;
        }
        self.body.push_str("}\n\n");
        self.cur_fn = None;
        Ok(())
    }

    fn emit_signature_line(&mut self, f: &Function, sig: &FnAbi, raw_abi: bool) {
        let name = if raw_abi {
            format!("{}_impl", sig.symbol)
        } else {
            sig.symbol.clone()
        };
        match &f.kind {
            FnKind::Plain => {
                if raw_abi {
                    let params: Vec<String> = sig
                        .impl_reprs
                        .iter()
                        .enumerate()
                        .map(|(i, r)| format!("{} %a{}", r.llvm(), i))
                        .collect();
                    let _ = writeln!(
                        self.body,
                        "define {} @{}({}) {{",
                        sig.impl_ret.llvm(),
                        name,
                        params.join(", ")
                    );
                } else {
                    let params: Vec<String> = (0..sig.abi_params.len())
                        .map(|i| format!("i64 %a{}", i))
                        .collect();
                    let all = if params.is_empty() {
                        "i64 %self".to_string()
                    } else {
                        format!("i64 %self, {}", params.join(", "))
                    };
                    let _ = writeln!(self.body, "define i64 @{}({}) {{", name, all);
                }
            }
            FnKind::BlockBody { .. } | FnKind::FiberBody { .. } => {
                let _ = writeln!(
                    self.body,
                    "define i64 @{}(i64 %yielded, i64 %env, i32 %argc, ptr %argv) {{",
                    name
                );
            }
            FnKind::ProtectedBody { .. }
            | FnKind::ElseBody { .. }
            | FnKind::EnsureBody { .. } => {
                let _ = writeln!(self.body, "define i64 @{}(i64 %env) {{", name);
            }
            FnKind::RescueHandler { .. } => {
                let _ = writeln!(self.body, "define i64 @{}(i64 %env, i64 %exc) {{", name);
            }
        }
    }

    /// Environment index of a local slot.
    pub fn env_index(id: LocalId) -> usize {
        ENV_RESERVED + id
    }

    /// The root's local table; outlined callbacks index their root parent's
    /// slots.
    fn env_size(&self, f: &Function) -> usize {
        let root = match &f.kind {
            FnKind::Plain => f,
            FnKind::BlockBody { parent }
            | FnKind::ProtectedBody { parent }
            | FnKind::RescueHandler { parent }
            | FnKind::ElseBody { parent }
            | FnKind::EnsureBody { parent }
            | FnKind::FiberBody { parent } => {
                self.program.function(parent).unwrap_or(f)
            }
        };
        ENV_RESERVED + root.locals.len()
    }

    fn emit_prologue(&mut self, f: &Function, sig: &FnAbi, raw_abi: bool) -> Result<(), String> {
        if self.profile && matches!(f.kind, FnKind::Plain) {
            let name = self.string_global(&f.key);
            let t = self.fresh();
            self.line(&format!("{} = call i64 @kp_prof_enter(ptr {})", t, name));
            self.prof_t0 = Some(t);
        }

        match &f.kind {
            FnKind::Plain if f.env_locals => {
                self.cur_self = "%self".to_string();
                let size = self.env_size(f);
                let env = self.fresh();
                self.line(&format!("{} = call i64 @rb_ary_new_capa(i64 {})", env, size));
                // force length so every slot reads as nil
                self.line(&format!(
                    "call i64 @rb_ary_store(i64 {}, i64 {}, i64 {})",
                    env,
                    size - 1,
                    runtime::QNIL
                ));
                self.line(&format!(
                    "call i64 @rb_ary_store(i64 {}, i64 {}, i64 {})",
                    env,
                    ENV_RET_FLAG,
                    runtime::QFALSE
                ));
                self.line(&format!(
                    "call i64 @rb_ary_store(i64 {}, i64 {}, i64 %self)",
                    env, ENV_SELF
                ));
                for (i, slot) in sig.abi_params.iter().enumerate() {
                    self.line(&format!(
                        "call i64 @rb_ary_store(i64 {}, i64 {}, i64 %a{})",
                        env,
                        Self::env_index(*slot),
                        i
                    ));
                }
                self.cur_env = Some(env);
            }
            FnKind::Plain => {
                self.cur_self = "%self".to_string();
                self.cur_env = None;
                // one alloca per local; parameters spill into their slots.
                // slots that may hold the undef sentinel (optional and
                // keyword parameters) stay boxed
                self.locals_reprs = f
                    .locals
                    .iter()
                    .map(|l| {
                        let r = Repr::of(&l.ty);
                        if r == Repr::I1 { Repr::I64 } else { r }
                    })
                    .collect();
                for p in &f.params {
                    if p.kind != ParamKind::Required {
                        self.locals_reprs[p.local] = Repr::Boxed;
                    }
                }
                for i in 0..f.locals.len() {
                    let repr = self.locals_reprs[i];
                    self.line(&format!("%l{} = alloca {}", i, repr.llvm()));
                    let init = match repr {
                        Repr::F64 => "0x0000000000000000".to_string(),
                        Repr::I64 => "0".to_string(),
                        _ => runtime::QNIL.to_string(),
                    };
                    self.line(&format!("store {} {}, ptr %l{}", repr.llvm(), init, i));
                }
                if raw_abi {
                    for (i, (slot, repr)) in sig
                        .abi_params
                        .iter()
                        .zip(sig.impl_reprs.iter())
                        .enumerate()
                    {
                        let v = EVal::new(format!("%a{}", i), *repr);
                        self.store_into_slot(*slot, &v);
                    }
                } else {
                    for (i, slot) in sig.abi_params.iter().enumerate() {
                        let v = EVal::new(format!("%a{}", i), Repr::Boxed);
                        self.store_into_slot(*slot, &v);
                    }
                }
            }
            FnKind::BlockBody { .. } | FnKind::FiberBody { .. } => {
                self.cur_env = Some("%env".to_string());
                self.load_self_from_env();
                // first block parameter is the yielded value; the rest come
                // from argv when present
                let param_slots: Vec<LocalId> =
                    f.params.iter().map(|p| p.local).collect();
                for (i, slot) in param_slots.iter().enumerate() {
                    if i == 0 {
                        let v = EVal::new("%yielded", Repr::Boxed);
                        self.store_into_slot(*slot, &v);
                    } else {
                        let have = self.fresh();
                        self.line(&format!("{} = icmp sgt i32 %argc, {}", have, i));
                        let load_l = format!("argload{}", i);
                        let skip_l = format!("argskip{}", i);
                        let done_l = format!("argdone{}", i);
                        self.line(&format!(
                            "br i1 {}, label %{}, label %{}",
                            have, load_l, skip_l
                        ));
                        self.label(&load_l);
                        let p = self.fresh();
                        self.line(&format!(
                            "{} = getelementptr i64, ptr %argv, i64 {}",
                            p, i
                        ));
                        let lv = self.fresh();
                        self.line(&format!("{} = load i64, ptr {}", lv, p));
                        let v = EVal::new(lv, Repr::Boxed);
                        self.store_into_slot(*slot, &v);
                        self.line(&format!("br label %{}", done_l));
                        self.label(&skip_l);
                        let v = EVal::new(runtime::QNIL.to_string(), Repr::Boxed);
                        self.store_into_slot(*slot, &v);
                        self.line(&format!("br label %{}", done_l));
                        self.label(&done_l);
                    }
                }
            }
            FnKind::ProtectedBody { .. }
            | FnKind::ElseBody { .. }
            | FnKind::EnsureBody { .. } => {
                self.cur_env = Some("%env".to_string());
                self.load_self_from_env();
            }
            FnKind::RescueHandler { .. } => {
                self.cur_env = Some("%env".to_string());
                self.load_self_from_env();
                if let Some(p) = f.params.first() {
                    let v = EVal::new("%exc", Repr::Boxed);
                    self.store_into_slot(p.local, &v);
                }
            }
        }
        Ok(())
    }

    fn load_self_from_env(&mut self) {
        let env = self.cur_env.clone().unwrap();
        let t = self.fresh();
        self.line(&format!(
            "{} = call i64 @rb_ary_entry(i64 {}, i64 {})",
            t, env, ENV_SELF
        ));
        self.cur_self = t;
    }

    /// Store a value into a local slot (env element or alloca).
    pub fn store_into_slot(&mut self, slot: LocalId, v: &EVal) {
        if let Some(env) = self.cur_env.clone() {
            let boxed = self.coerce(v, Repr::Boxed);
            self.line(&format!(
                "call i64 @rb_ary_store(i64 {}, i64 {}, i64 {})",
                env,
                Self::env_index(slot),
                boxed.name
            ));
        } else {
            let repr = self.locals_reprs[slot];
            let conv = self.coerce(v, repr);
            self.line(&format!(
                "store {} {}, ptr %l{}",
                repr.llvm(),
                conv.name,
                slot
            ));
        }
    }

    /// Load a local slot; `ty` is the HIR type label at the load site.
    pub fn load_from_slot(&mut self, slot: LocalId, ty: &Type) -> EVal {
        if let Some(env) = self.cur_env.clone() {
            let t = self.fresh();
            self.line(&format!(
                "{} = call i64 @rb_ary_entry(i64 {}, i64 {})",
                t, env, Self::env_index(slot)
            ));
            let v = EVal::new(t, Repr::Boxed);
            let want = Repr::of(ty);
            if want != Repr::Boxed {
                self.coerce(&v, want)
            } else {
                v
            }
        } else {
            let repr = self.locals_reprs[slot];
            let t = self.fresh();
            self.line(&format!("{} = load {}, ptr %l{}", t, repr.llvm(), slot));
            let v = EVal::new(t, repr);
            // boolean slots are stored widened; recover the condition bit
            if *ty == Type::Bool && repr == Repr::I64 {
                return self.coerce(&v, Repr::I1);
            }
            v
        }
    }

    /// Load an arbitrary env element (reserved slots).
    pub fn load_env_raw(&mut self, index: usize) -> EVal {
        let env = self.cur_env.clone().expect("env function");
        let t = self.fresh();
        self.line(&format!(
            "{} = call i64 @rb_ary_entry(i64 {}, i64 {})",
            t, env, index
        ));
        EVal::new(t, Repr::Boxed)
    }

    pub fn store_env_raw(&mut self, index: usize, v: &EVal) {
        let env = self.cur_env.clone().expect("env function");
        let boxed = self.coerce(v, Repr::Boxed);
        self.line(&format!(
            "call i64 @rb_ary_store(i64 {}, i64 {}, i64 {})",
            env, index, boxed.name
        ));
    }

    // ---- terminators ----------------------------------------------------

    fn emit_terminator(&mut self, _f: &Function, t: &Terminator) -> Result<(), String> {
        match t {
            Terminator::Jump(l) => {
                self.line(&format!("br label %bb_{}", l));
            }
            Terminator::Branch { cond, then_label, else_label } => {
                let c = self.value(*cond)?;
                let b = self.truthy(&c);
                self.line(&format!(
                    "br i1 {}, label %bb_{}, label %bb_{}",
                    b, then_label, else_label
                ));
            }
            Terminator::Return(v) => {
                let val = self.value(*v)?;
                let out = self.coerce(&val, self.cur_ret);
                if let Some(t0) = self.prof_t0.clone() {
                    let key = self.cur_fn.map(|f| f.key.clone()).unwrap_or_default();
                    let name = self.string_global(&key);
                    self.line(&format!(
                        "call void @kp_prof_exit(ptr {}, i64 {})",
                        name, t0
                    ));
                }
                self.line(&format!("ret {} {}", self.cur_ret.llvm(), out.name));
            }
            Terminator::Raise(kind) => {
                self.emit_raise(kind)?;
            }
        }
        Ok(())
    }

    fn emit_raise(&mut self, kind: &RaiseKind) -> Result<(), String> {
        match kind {
            RaiseKind::Value(v) => {
                let val = self.value(*v)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                self.line(&format!("call void @rb_exc_raise(i64 {})", boxed.name));
            }
            RaiseKind::Rethrow => {
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_errinfo()", t));
                self.line(&format!("call void @rb_exc_raise(i64 {})", t));
            }
            RaiseKind::ArgumentError { message } => {
                let cls = self.fresh();
                self.line(&format!("{} = load i64, ptr @rb_eArgError", cls));
                let fmt = self.string_global("%s");
                let msg = self.string_global(message);
                self.line(&format!(
                    "call void (i64, ptr, ...) @rb_raise(i64 {}, ptr {}, ptr {})",
                    cls, fmt, msg
                ));
            }
            RaiseKind::NoMatchingPattern { value } => {
                // build the exception from the subject's inspect output
                let val = self.value(*value)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                let cls = self.fresh();
                self.line(&format!(
                    "{} = load i64, ptr @rb_eNoMatchingPatternError",
                    cls
                ));
                let mid = self.intern("inspect");
                let ins = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_funcallv(i64 {}, i64 {}, i32 0, ptr null)",
                    ins, boxed.name, mid
                ));
                let exc = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_exc_new_str(i64 {}, i64 {})",
                    exc, cls, ins
                ));
                self.line(&format!("call void @rb_exc_raise(i64 {})", exc));
            }
        }
        self.line("unreachable");
        Ok(())
    }

    /// The converted incoming value of a phi, prepared in the predecessor.
    pub fn phi_input(&self, phi: ValueId, pred_label: &str) -> Option<EVal> {
        self.phi_ins.get(&(phi, pred_label.to_string())).cloned()
    }

    // ---- assembly -------------------------------------------------------

    fn native_struct_types(&self) -> String {
        let mut out = String::new();
        // embedded layouts must be defined before the structs embedding them
        let mut emitted: Vec<String> = Vec::new();
        let natives: Vec<String> = self
            .registry
            .classes
            .values()
            .filter(|c| c.annotations.native)
            .map(|c| c.name.clone())
            .collect();
        let mut natives_sorted = natives.clone();
        natives_sorted.sort();
        let mut progress = true;
        while progress {
            progress = false;
            for name in &natives_sorted {
                if emitted.contains(name) {
                    continue;
                }
                let Some(def) = self.registry.native_class_type(name) else { continue };
                let deps_ready = def.fields.iter().all(|(_, k)| match k {
                    crate::sig::FieldKind::Embedded(dep) => emitted.contains(dep),
                    _ => true,
                });
                if !deps_ready {
                    continue;
                }
                let mut fields: Vec<String> = Vec::new();
                if def.annotations.vtable {
                    fields.push("ptr".to_string());
                }
                for (_, kind) in &def.fields {
                    fields.push(match kind {
                        crate::sig::FieldKind::Int64 => "i64".to_string(),
                        crate::sig::FieldKind::Float64 => "double".to_string(),
                        crate::sig::FieldKind::Bool => "i8".to_string(),
                        crate::sig::FieldKind::Value | crate::sig::FieldKind::Ref(_) => {
                            "i64".to_string()
                        }
                        crate::sig::FieldKind::Embedded(c) => {
                            format!("%struct.{}", c.replace("::", "."))
                        }
                    });
                }
                let _ = writeln!(
                    out,
                    "%struct.{} = type {{ {} }}",
                    name.replace("::", "."),
                    fields.join(", ")
                );
                emitted.push(name.clone());
                progress = true;
            }
        }
        out
    }

    fn assemble(self, module_name: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; konpeito module '{}'", module_name);
        out.push('\n');
        out.push_str(&runtime::prelude());
        if self.profile {
            out.push_str(runtime::profiling_decls());
        }
        for d in &self.extra_decls {
            out.push_str(d);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.native_struct_types());
        out.push('\n');
        out.push_str(&self.globals);
        out.push('\n');
        out.push_str(&self.body);
        out.push_str(&self.aux);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::hir::lower;
    use crate::tast;

    fn compile_ir(json: &str, rbs: &str) -> String {
        let root = Root::from_json(json).expect("CST should parse");
        let mut registry = SignatureRegistry::new();
        if !rbs.is_empty() {
            registry.load_document(rbs, "test.rbs").unwrap();
            registry.finalize().unwrap();
        }
        let mut tp = tast::build::build(&root, &registry).unwrap();
        crate::infer::run(&mut tp).unwrap();
        let mut p = lower::lower(&tp).unwrap();
        crate::opt::run(&mut p).unwrap();
        emit(
            &p,
            &registry,
            &EmitOptions { profile: false, module_name: "test".into() },
        )
        .unwrap()
    }

    #[test]
    fn test_inferred_integers_add_unboxed() {
        // add_integers(1, 2) infers Integer end to end: the impl adds raw
        // i64 with no boxing call on the hot path
        let ir = compile_ir(
            r#"{"body": [
                 {"kind": "def", "name": "add_integers",
                  "params": {"list": [{"name": "a"}, {"name": "b"}]},
                  "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "a"},
                            "name": "+", "args": [{"kind": "lvar", "name": "b"}]}]},
                 {"kind": "def", "name": "test_add", "params": {"list": []},
                  "body": [{"kind": "call", "receiver": null, "name": "add_integers",
                            "args": [{"kind": "int", "value": 1},
                                     {"kind": "int", "value": 2}]}]}]}"#,
            "",
        );
        assert!(ir.contains("define i64 @kp_add_integers_impl(i64 %a0, i64 %a1)"), "{}", ir);
        assert!(ir.contains("add i64"), "expected raw add: {}", ir);
        // the caller's copy (the inliner ran) adds unboxed too: nothing
        // interns '+' for dispatch
        assert!(
            !ir.contains("c\"+\\00\""),
            "no interned '+' dispatch expected:\n{}",
            ir
        );
    }

    #[test]
    fn test_signed_branch_merges_as_unboxed_phi() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "def", "name": "choose_int",
                 "params": {"list": [{"name": "c"}]},
                 "body": [{"kind": "if",
                           "cond": {"kind": "lvar", "name": "c"},
                           "then_body": [{"kind": "int", "value": 10}],
                           "else_body": [{"kind": "int", "value": 20}]}]}]}"#,
            "class Object\n  def choose_int: (bool c) -> Integer\nend\n",
        );
        assert!(
            ir.contains("phi i64 [ 10,") && ir.contains("[ 20,"),
            "expected an unboxed phi over the branch constants:\n{}",
            ir
        );
    }

    #[test]
    fn test_required_keyword_checks_sentinel_and_raises() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "def", "name": "greet",
                 "params": {"list": [{"name": "name", "label": "keyword"}]},
                 "body": [{"kind": "lvar", "name": "name"}]}]}"#,
            "",
        );
        assert!(ir.contains("rb_hash_lookup2"), "{}", ir);
        // the looked-up value compares against the undef sentinel
        assert!(ir.contains(&format!(", {}", runtime::QUNDEF)), "{}", ir);
        assert!(ir.contains("missing keyword: :name"), "{}", ir);
        assert!(ir.contains("@rb_raise"), "{}", ir);
    }

    #[test]
    fn test_rescue_region_uses_rescue2_and_ensure() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "def", "name": "guarded", "params": {"list": []},
                 "body": [{"kind": "begin",
                           "body": [{"kind": "int", "value": 1}],
                           "rescues": [{"classes": ["ArgumentError"], "binder": null,
                                        "body": [{"kind": "int", "value": 2}]}],
                           "else_body": [],
                           "ensure_body": [{"kind": "int", "value": 3}]}]}]}"#,
            "",
        );
        assert!(ir.contains("@rb_rescue2(ptr @kp_guarded__body"), "{}", ir);
        assert!(ir.contains("call i64 @rb_ensure(ptr @kp_region_guarded_0"), "{}", ir);
        assert!(ir.contains("call void @rb_exc_raise(i64 %exc)"), "re-raise path: {}", ir);
        assert!(ir.contains("ArgumentError"), "{}", ir);
    }

    #[test]
    fn test_native_class_field_access_is_struct_gep() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "class_def", "name": "Vector2", "superclass": null,
                 "body": [{"kind": "def", "name": "length_squared", "params": {"list": []},
                           "body": [{"kind": "call",
                                     "receiver": {"kind": "call",
                                                  "receiver": {"kind": "ivar", "name": "@x"},
                                                  "name": "*",
                                                  "args": [{"kind": "ivar", "name": "@x"}]},
                                     "name": "+",
                                     "args": [{"kind": "call",
                                               "receiver": {"kind": "ivar", "name": "@y"},
                                               "name": "*",
                                               "args": [{"kind": "ivar", "name": "@y"}]}]}]}]}]}"#,
            "%a{native}\nclass Vector2\n  @x: Float\n  @y: Float\n  def length_squared: () -> Float\nend\n",
        );
        assert!(ir.contains("%struct.Vector2 = type { double, double }"), "{}", ir);
        assert!(ir.contains("rb_check_typeddata"), "{}", ir);
        assert!(ir.contains("getelementptr %struct.Vector2"), "{}", ir);
        assert!(ir.contains("fmul double"), "raw float multiply expected: {}", ir);
        assert!(ir.contains("fadd double"), "{}", ir);
    }

    #[test]
    fn test_unknown_method_goes_through_funcall() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "def", "name": "poke",
                 "params": {"list": [{"name": "x"}]},
                 "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "x"},
                           "name": "frobnicate", "args": []}]}]}"#,
            "",
        );
        assert!(ir.contains("@rb_funcallv"), "{}", ir);
        assert!(ir.contains("frobnicate"), "{}", ir);
    }

    #[test]
    fn test_emission_is_deterministic() {
        let json = r#"{"body": [
             {"kind": "class_def", "name": "Counter", "superclass": null,
              "body": [{"kind": "def", "name": "tick", "params": {"list": []},
                        "body": [{"kind": "op_assign",
                                  "target": {"kind": "ivar", "name": "@n"},
                                  "op": "+",
                                  "value": {"kind": "int", "value": 1}}]}]},
             {"kind": "call", "receiver": null, "name": "puts",
              "args": [{"kind": "str", "value": "hello"}]}]}"#;
        let a = compile_ir(json, "");
        let b = compile_ir(json, "");
        assert_eq!(a, b, "same inputs must produce byte-identical IR");
    }

    #[test]
    fn test_integer_division_checks_zero_and_floors() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "def", "name": "quot",
                 "params": {"list": [{"name": "a"}, {"name": "b"}]},
                 "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "a"},
                           "name": "/", "args": [{"kind": "lvar", "name": "b"}]}]},
                 {"kind": "call", "receiver": null, "name": "quot",
                  "args": [{"kind": "int", "value": 7}, {"kind": "int", "value": 2}]}]}"#,
            "",
        );
        assert!(ir.contains("sdiv i64"), "{}", ir);
        assert!(ir.contains("@rb_eZeroDivError"), "{}", ir);
        assert!(ir.contains("divided by 0"), "{}", ir);
    }

    #[test]
    fn test_block_call_passes_callback_and_env() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "def", "name": "sum", "params": {"list": [{"name": "xs"}]},
                 "body": [{"kind": "call",
                           "receiver": {"kind": "lvar", "name": "xs"},
                           "name": "each", "args": [],
                           "block": {"params": {"list": [{"name": "x"}]},
                                     "body": [{"kind": "lvar", "name": "x"}]}}]}]}"#,
            "",
        );
        assert!(ir.contains("@rb_block_call"), "{}", ir);
        assert!(
            ir.contains("define i64 @kp_sum__block0(i64 %yielded, i64 %env, i32 %argc, ptr %argv)"),
            "{}",
            ir
        );
        assert!(ir.contains("@rb_ary_new_capa"), "environment array: {}", ir);
    }

    #[test]
    fn test_super_and_yield_helpers() {
        let ir = compile_ir(
            r#"{"body": [{"kind": "class_def", "name": "Dog", "superclass": "Animal",
                 "body": [{"kind": "def", "name": "speak", "params": {"list": []},
                           "body": [{"kind": "super_call", "args": [], "implicit": true}]},
                          {"kind": "def", "name": "each_leg", "params": {"list": []},
                           "body": [{"kind": "yield_expr", "args": [{"kind": "int", "value": 4}]}]}]}]}"#,
            "",
        );
        assert!(ir.contains("@rb_call_super"), "{}", ir);
        assert!(ir.contains("@rb_yield_values2"), "{}", ir);
    }
}
