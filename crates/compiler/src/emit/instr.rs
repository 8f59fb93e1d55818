//! Per-instruction IR emission.
//!
//! Operator calls between raw scalars compile to machine arithmetic and
//! comparisons (with host division semantics: floored quotient, zero
//! check); everything else goes through the host C API. Instance-variable
//! access inside native-class methods compiles to struct field access
//! through the TypedData pointer instead of the ivar table.

use super::*;
use crate::sig::FieldKind;

impl<'a> Emitter<'a> {
    pub(super) fn emit_instr(&mut self, f: &Function, i: &Instr) -> Result<(), String> {
        let out = match &i.op {
            Op::ConstInt(v) => EVal::new(v.to_string(), Repr::I64),
            Op::ConstFloat(v) => EVal::new(format!("0x{:016X}", v.to_bits()), Repr::F64),
            Op::ConstBool(v) => EVal::new(if *v { "true" } else { "false" }, Repr::I1),
            Op::ConstNil => EVal::new(runtime::QNIL.to_string(), Repr::Boxed),
            Op::ConstStr(s) => {
                let g = self.string_global(s);
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_str_new_cstr(ptr {})", t, g));
                EVal::new(t, Repr::Boxed)
            }
            Op::ConstSym(name) => {
                let id = self.intern(name);
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_id2sym(i64 {})", t, id));
                EVal::new(t, Repr::Boxed)
            }
            Op::SelfVal => EVal::new(self.cur_self.clone(), Repr::Boxed),

            Op::LoadLocal(slot) => self.load_from_slot(*slot, &i.ty),
            Op::StoreLocal(slot, v) => {
                let val = self.value(*v)?;
                self.store_into_slot(*slot, &val);
                EVal::new(runtime::QNIL.to_string(), Repr::Boxed)
            }
            Op::LoadEnv(index) => {
                let v = self.load_env_raw(*index);
                let want = Repr::of(&i.ty);
                if want != Repr::Boxed {
                    self.coerce(&v, want)
                } else {
                    v
                }
            }
            Op::StoreEnv(index, v) => {
                let val = self.value(*v)?;
                self.store_env_raw(*index, &val);
                EVal::new(runtime::QNIL.to_string(), Repr::Boxed)
            }

            Op::LoadGvar(name) => {
                let g = self.string_global(name);
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_gv_get(ptr {})", t, g));
                EVal::new(t, Repr::Boxed)
            }
            Op::StoreGvar(name, v) => {
                let val = self.value(*v)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                let g = self.string_global(name);
                self.line(&format!(
                    "call i64 @rb_gv_set(ptr {}, i64 {})",
                    g, boxed.name
                ));
                EVal::new(runtime::QNIL.to_string(), Repr::Boxed)
            }

            Op::LoadIvar(name) => self.emit_ivar_load(f, name, &i.ty)?,
            Op::StoreIvar(name, v) => {
                let val = self.value(*v)?;
                self.emit_ivar_store(f, name, &val)?;
                EVal::new(runtime::QNIL.to_string(), Repr::Boxed)
            }

            Op::LoadCvar(name) => {
                let klass = self.class_of_self(f);
                let id = self.intern(name);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_cvar_get(i64 {}, i64 {})",
                    t, klass, id
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::StoreCvar(name, v) => {
                let val = self.value(*v)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                let klass = self.class_of_self(f);
                let id = self.intern(name);
                self.line(&format!(
                    "call void @rb_cvar_set(i64 {}, i64 {}, i64 {})",
                    klass, id, boxed.name
                ));
                EVal::new(runtime::QNIL.to_string(), Repr::Boxed)
            }

            Op::LoadConst(path) => {
                let t = self.const_get(path);
                EVal::new(t, Repr::Boxed)
            }
            Op::StoreConst(name, v) => {
                let val = self.value(*v)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                let obj = self.fresh();
                self.line(&format!("{} = load i64, ptr @rb_cObject", obj));
                let id = self.intern(name);
                self.line(&format!(
                    "call void @rb_const_set(i64 {}, i64 {}, i64 {})",
                    obj, id, boxed.name
                ));
                EVal::new(runtime::QNIL.to_string(), Repr::Boxed)
            }

            Op::ArrayNew(items) => {
                let vals: Vec<EVal> = items
                    .iter()
                    .map(|v| self.value(*v))
                    .collect::<Result<_, _>>()?;
                let argv = self.argv_array(&vals);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_ary_new_from_values(i64 {}, ptr {})",
                    t,
                    vals.len(),
                    argv
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::HashNew(pairs) => {
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_hash_new()", t));
                for (k, v) in pairs {
                    let kv = self.value(*k)?;
                    let vv = self.value(*v)?;
                    let kb = self.coerce(&kv, Repr::Boxed);
                    let vb = self.coerce(&vv, Repr::Boxed);
                    self.line(&format!(
                        "call i64 @rb_hash_aset(i64 {}, i64 {}, i64 {})",
                        t, kb.name, vb.name
                    ));
                }
                EVal::new(t, Repr::Boxed)
            }
            Op::RangeNew { low, high, exclusive } => {
                let l = self.value(*low)?;
                let h = self.value(*high)?;
                let lb = self.coerce(&l, Repr::Boxed);
                let hb = self.coerce(&h, Repr::Boxed);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_range_new(i64 {}, i64 {}, i32 {})",
                    t,
                    lb.name,
                    hb.name,
                    if *exclusive { 1 } else { 0 }
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::RegexpNew(src) => {
                let g = self.string_global(src);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_reg_new(ptr {}, i64 {}, i32 0)",
                    t,
                    g,
                    src.len()
                ));
                EVal::new(t, Repr::Boxed)
            }

            Op::CallMethod { recv, method, args, kwargs, block_fn, .. } => {
                self.emit_call_method(recv.as_ref(), method, args, kwargs, block_fn.as_deref())?
            }
            Op::CallFn { key, args } => self.emit_call_fn(key, args)?,
            Op::SuperCall { args } => {
                let vals: Vec<EVal> = args
                    .iter()
                    .map(|v| self.value(*v))
                    .collect::<Result<_, _>>()?;
                let argv = self.argv_array(&vals);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_call_super(i32 {}, ptr {})",
                    t,
                    vals.len(),
                    argv
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::NativeCall { class, method, recv, args, vtable } => {
                self.emit_native_call(class, method, *recv, args, *vtable)?
            }
            Op::CfuncCall { symbol, recv, args } => {
                let r = self.value(*recv)?;
                let rb = self.coerce(&r, Repr::Boxed);
                let mut parts = vec![format!("i64 {}", rb.name)];
                for a in args {
                    let v = self.value(*a)?;
                    let b = self.coerce(&v, Repr::Boxed);
                    parts.push(format!("i64 {}", b.name));
                }
                let sig: Vec<&str> = parts.iter().map(|_| "i64").collect();
                self.extra_decls
                    .insert(format!("declare i64 @{}({})", symbol, sig.join(", ")));
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @{}({})",
                    t,
                    symbol,
                    parts.join(", ")
                ));
                EVal::new(t, Repr::Boxed)
            }

            Op::ProcNew { body_fn, .. } => {
                let env = self
                    .cur_env
                    .clone()
                    .ok_or("proc creation outside an environment-carrying function")?;
                let sym = symbol_for(body_fn);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_proc_new(ptr @{}, i64 {})",
                    t, sym, env
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::FiberNew { body_fn } => {
                let env = self
                    .cur_env
                    .clone()
                    .ok_or("fiber creation outside an environment-carrying function")?;
                let sym = symbol_for(body_fn);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_fiber_new(ptr @{}, i64 {})",
                    t, sym, env
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::FiberYield { args } => {
                let vals: Vec<EVal> = args
                    .iter()
                    .map(|v| self.value(*v))
                    .collect::<Result<_, _>>()?;
                let argv = self.argv_array(&vals);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_fiber_yield(i32 {}, ptr {})",
                    t,
                    vals.len(),
                    argv
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::YieldBlock { args } => {
                let vals: Vec<EVal> = args
                    .iter()
                    .map(|v| self.value(*v))
                    .collect::<Result<_, _>>()?;
                let argv = self.argv_array(&vals);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_yield_values2(i32 {}, ptr {})",
                    t,
                    vals.len(),
                    argv
                ));
                EVal::new(t, Repr::Boxed)
            }

            Op::KindOf { value, class_name } => {
                let v = self.value(*value)?;
                match v.repr {
                    // a raw scalar's class is known statically
                    Repr::I64 => {
                        let is = class_name == "Integer" || class_name == "Numeric"
                            || class_name == "Comparable" || class_name == "Object";
                        EVal::new(if is { "true" } else { "false" }, Repr::I1)
                    }
                    Repr::F64 => {
                        let is = class_name == "Float" || class_name == "Numeric"
                            || class_name == "Object";
                        EVal::new(if is { "true" } else { "false" }, Repr::I1)
                    }
                    _ => {
                        let boxed = self.coerce(&v, Repr::Boxed);
                        let cls = self.const_get(class_name);
                        let t = self.fresh();
                        self.line(&format!(
                            "{} = call i64 @rb_obj_is_kind_of(i64 {}, i64 {})",
                            t, boxed.name, cls
                        ));
                        self.coerce(&EVal::new(t, Repr::Boxed), Repr::I1)
                    }
                }
            }
            Op::ValueEq { lhs, rhs } => {
                let l = self.value(*lhs)?;
                let r = self.value(*rhs)?;
                if l.repr == Repr::I64 && r.repr == Repr::I64 {
                    let t = self.fresh();
                    self.line(&format!("{} = icmp eq i64 {}, {}", t, l.name, r.name));
                    EVal::new(t, Repr::I1)
                } else {
                    let lb = self.coerce(&l, Repr::Boxed);
                    let rb = self.coerce(&r, Repr::Boxed);
                    let t = self.fresh();
                    self.line(&format!(
                        "{} = call i64 @rb_equal(i64 {}, i64 {})",
                        t, lb.name, rb.name
                    ));
                    self.coerce(&EVal::new(t, Repr::Boxed), Repr::I1)
                }
            }
            Op::ArrayLen(v) => {
                let a = self.value(*v)?;
                let ab = self.coerce(&a, Repr::Boxed);
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_array_len(i64 {})", t, ab.name));
                EVal::new(t, Repr::I64)
            }
            Op::ArrayGet { ary, index } => {
                let a = self.value(*ary)?;
                let ab = self.coerce(&a, Repr::Boxed);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_ary_entry(i64 {}, i64 {})",
                    t, ab.name, index
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::ArraySlice { ary, start, drop_back } => {
                let a = self.value(*ary)?;
                let ab = self.coerce(&a, Repr::Boxed);
                let len = self.fresh();
                self.line(&format!("{} = call i64 @rb_array_len(i64 {})", len, ab.name));
                let take = self.fresh();
                self.line(&format!(
                    "{} = sub i64 {}, {}",
                    take,
                    len,
                    start + drop_back
                ));
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_ary_subseq(i64 {}, i64 {}, i64 {})",
                    t, ab.name, start, take
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::ToArray(v) => {
                let a = self.value(*v)?;
                let ab = self.coerce(&a, Repr::Boxed);
                let t = self.fresh();
                self.line(&format!("{} = call i64 @rb_Array(i64 {})", t, ab.name));
                EVal::new(t, Repr::Boxed)
            }
            Op::HashHasKey { hash, key } => {
                let h = self.value(*hash)?;
                let hb = self.coerce(&h, Repr::Boxed);
                let sym = self.sym_value(key);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_hash_lookup2(i64 {}, i64 {}, i64 {})",
                    t,
                    hb.name,
                    sym,
                    runtime::QUNDEF
                ));
                let c = self.fresh();
                self.line(&format!(
                    "{} = icmp ne i64 {}, {}",
                    c,
                    t,
                    runtime::QUNDEF
                ));
                EVal::new(c, Repr::I1)
            }
            Op::HashGetSym { hash, key } => {
                let h = self.value(*hash)?;
                let hb = self.coerce(&h, Repr::Boxed);
                let sym = self.sym_value(key);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_hash_aref(i64 {}, i64 {})",
                    t, hb.name, sym
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::KwLookup { hash, name } => {
                let h = self.value(*hash)?;
                let hb = self.coerce(&h, Repr::Boxed);
                let sym = self.sym_value(name);
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @rb_hash_lookup2(i64 {}, i64 {}, i64 {})",
                    t,
                    hb.name,
                    sym,
                    runtime::QUNDEF
                ));
                EVal::new(t, Repr::Boxed)
            }
            Op::IsUndef(v) => {
                let val = self.value(*v)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                let t = self.fresh();
                self.line(&format!(
                    "{} = icmp eq i64 {}, {}",
                    t,
                    boxed.name,
                    runtime::QUNDEF
                ));
                EVal::new(t, Repr::I1)
            }

            Op::Rescue { body_fn, arms, else_fn, ensure_fn, completed_slot } => self
                .emit_rescue_region(
                    body_fn,
                    arms,
                    else_fn.as_deref(),
                    ensure_fn.as_deref(),
                    *completed_slot,
                )?,

            Op::Phi { incomings } => {
                let want = Repr::of(&i.ty);
                let mut parts = Vec::with_capacity(incomings.len());
                for (pred, _) in incomings {
                    let input = self.phi_input(i.dst, pred).ok_or_else(|| {
                        format!("emitter: phi input from '{}' missing", pred)
                    })?;
                    let label = self
                        .block_actual
                        .get(pred)
                        .cloned()
                        .unwrap_or_else(|| format!("bb_{}", pred));
                    parts.push(format!("[ {}, %{} ]", input.name, label));
                }
                let t = self.fresh();
                self.line(&format!(
                    "{} = phi {} {}",
                    t,
                    want.llvm(),
                    parts.join(", ")
                ));
                EVal::new(t, want)
            }
        };
        self.set_value(i.dst, out);
        Ok(())
    }

    /// An interned symbol VALUE.
    fn sym_value(&mut self, name: &str) -> String {
        let id = self.intern(name);
        let t = self.fresh();
        self.line(&format!("{} = call i64 @rb_id2sym(i64 {})", t, id));
        t
    }

    /// `self`'s class: the receiver itself in singleton methods, otherwise
    /// the class-of helper.
    fn class_of_self(&mut self, f: &Function) -> String {
        if f.singleton {
            self.cur_self.clone()
        } else {
            let t = self.fresh();
            self.line(&format!(
                "{} = call i64 @rb_obj_class(i64 {})",
                t, self.cur_self
            ));
            t
        }
    }

    // ---- instance variables --------------------------------------------

    fn native_owner(&self, f: &Function) -> Option<String> {
        match &f.owner {
            Some(FnOwner::Class(c))
                if !f.singleton && self.registry.is_native_class(c) =>
            {
                Some(c.clone())
            }
            _ => None,
        }
    }

    fn emit_ivar_load(&mut self, f: &Function, name: &str, ty: &Type) -> Result<EVal, String> {
        if let Some(class) = self.native_owner(f) {
            if let Some(v) = self.emit_native_field_load(&class, name)? {
                return Ok(v);
            }
        }
        let id = self.intern(name);
        let t = self.fresh();
        self.line(&format!(
            "{} = call i64 @rb_ivar_get(i64 {}, i64 {})",
            t, self.cur_self, id
        ));
        let v = EVal::new(t, Repr::Boxed);
        let want = Repr::of(ty);
        if want != Repr::Boxed && ty.is_unboxed_scalar() {
            Ok(self.coerce(&v, want))
        } else {
            Ok(v)
        }
    }

    fn emit_ivar_store(&mut self, f: &Function, name: &str, val: &EVal) -> Result<(), String> {
        if let Some(class) = self.native_owner(f) {
            if self.emit_native_field_store(&class, name, val)? {
                return Ok(());
            }
        }
        let boxed = self.coerce(val, Repr::Boxed);
        let id = self.intern(name);
        self.line(&format!(
            "call i64 @rb_ivar_set(i64 {}, i64 {}, i64 {})",
            self.cur_self, id, boxed.name
        ));
        Ok(())
    }

    /// TypedData pointer of `self` for a native class.
    fn unwrap_self(&mut self, class: &str) -> String {
        self.extra_decls.insert(format!(
            "@kp_{}_data_type = external global i8",
            mangle(class)
        ));
        let t = self.fresh();
        self.line(&format!(
            "{} = call ptr @rb_check_typeddata(i64 {}, ptr @kp_{}_data_type)",
            t,
            self.cur_self,
            mangle(class)
        ));
        t
    }

    fn field_gep(&mut self, class: &str, ptr: &str, field_idx: usize, vtable: bool) -> String {
        let idx = field_idx + usize::from(vtable);
        let t = self.fresh();
        self.line(&format!(
            "{} = getelementptr %struct.{}, ptr {}, i32 0, i32 {}",
            t,
            class.replace("::", "."),
            ptr,
            idx
        ));
        t
    }

    fn emit_native_field_load(
        &mut self,
        class: &str,
        ivar: &str,
    ) -> Result<Option<EVal>, String> {
        let Some(def) = self.registry.native_class_type(class) else { return Ok(None) };
        let field = ivar.trim_start_matches('@');
        let Some(idx) = def.fields.iter().position(|(n, _)| n == field) else {
            return Ok(None);
        };
        let kind = def.fields[idx].1.clone();
        match kind {
            FieldKind::Embedded(_) | FieldKind::Ref(_) => {
                // embedded and reference fields go through the shim's
                // accessors, which carry the copy/wrap semantics
                let sym = format!("kp_{}_attr_get_{}", mangle(class), field);
                self.extra_decls
                    .insert(format!("declare i64 @{}(i64)", sym));
                let t = self.fresh();
                self.line(&format!(
                    "{} = call i64 @{}(i64 {})",
                    t, sym, self.cur_self
                ));
                Ok(Some(EVal::new(t, Repr::Boxed)))
            }
            _ => {
                let p = self.unwrap_self(class);
                let fp = self.field_gep(class, &p, idx, def.annotations.vtable);
                let t = self.fresh();
                Ok(Some(match kind {
                    FieldKind::Int64 => {
                        self.line(&format!("{} = load i64, ptr {}", t, fp));
                        EVal::new(t, Repr::I64)
                    }
                    FieldKind::Float64 => {
                        self.line(&format!("{} = load double, ptr {}", t, fp));
                        EVal::new(t, Repr::F64)
                    }
                    FieldKind::Bool => {
                        self.line(&format!("{} = load i8, ptr {}", t, fp));
                        let c = self.fresh();
                        self.line(&format!("{} = icmp ne i8 {}, 0", c, t));
                        EVal::new(c, Repr::I1)
                    }
                    _ => {
                        self.line(&format!("{} = load i64, ptr {}", t, fp));
                        EVal::new(t, Repr::Boxed)
                    }
                }))
            }
        }
    }

    fn emit_native_field_store(
        &mut self,
        class: &str,
        ivar: &str,
        val: &EVal,
    ) -> Result<bool, String> {
        let Some(def) = self.registry.native_class_type(class) else { return Ok(false) };
        let field = ivar.trim_start_matches('@');
        let Some(idx) = def.fields.iter().position(|(n, _)| n == field) else {
            return Ok(false);
        };
        let kind = def.fields[idx].1.clone();
        match kind {
            FieldKind::Embedded(_) | FieldKind::Ref(_) => {
                let sym = format!("kp_{}_attr_set_{}", mangle(class), field);
                self.extra_decls
                    .insert(format!("declare void @{}(i64, i64)", sym));
                let boxed = self.coerce(val, Repr::Boxed);
                self.line(&format!(
                    "call void @{}(i64 {}, i64 {})",
                    sym, self.cur_self, boxed.name
                ));
            }
            _ => {
                let p = self.unwrap_self(class);
                let fp = self.field_gep(class, &p, idx, def.annotations.vtable);
                match kind {
                    FieldKind::Int64 => {
                        let v = self.coerce(val, Repr::I64);
                        self.line(&format!("store i64 {}, ptr {}", v.name, fp));
                    }
                    FieldKind::Float64 => {
                        let v = self.coerce(val, Repr::F64);
                        self.line(&format!("store double {}, ptr {}", v.name, fp));
                    }
                    FieldKind::Bool => {
                        let v = self.coerce(val, Repr::I1);
                        let b = self.fresh();
                        self.line(&format!("{} = zext i1 {} to i8", b, v.name));
                        self.line(&format!("store i8 {}, ptr {}", b, fp));
                    }
                    _ => {
                        let v = self.coerce(val, Repr::Boxed);
                        self.line(&format!("store i64 {}, ptr {}", v.name, fp));
                    }
                }
            }
        }
        Ok(true)
    }

    // ---- calls ----------------------------------------------------------

    fn emit_call_fn(&mut self, key: &str, args: &[ValueId]) -> Result<EVal, String> {
        let Some((symbol, has_impl, impl_reprs, impl_ret)) = self.callee_abi(key) else {
            return Err(format!("emitter: direct call to unknown function '{}'", key));
        };
        let mut vals: Vec<EVal> = args
            .iter()
            .map(|v| self.value(*v))
            .collect::<Result<_, _>>()?;
        // pad missing trailing arguments with each parameter kind's
        // absent-value: the undef sentinel for optionals (the prologue
        // substitutes the default), empty collections for rest/kwargs
        if let Some(callee) = self.program.function(key) {
            let abi: Vec<ParamKind> = callee
                .params
                .iter()
                .filter(|p| !matches!(p.kind, ParamKind::Keyword | ParamKind::KeywordOptional))
                .map(|p| p.kind)
                .collect();
            while vals.len() < abi.len() {
                let kind = abi[vals.len()];
                let pad = match kind {
                    ParamKind::Optional => {
                        EVal::new(runtime::QUNDEF.to_string(), Repr::Boxed)
                    }
                    ParamKind::Rest => {
                        let t = self.fresh();
                        self.line(&format!("{} = call i64 @rb_ary_new_capa(i64 0)", t));
                        EVal::new(t, Repr::Boxed)
                    }
                    ParamKind::KeywordRest => {
                        let t = self.fresh();
                        self.line(&format!("{} = call i64 @rb_hash_new()", t));
                        EVal::new(t, Repr::Boxed)
                    }
                    _ => EVal::new(runtime::QNIL.to_string(), Repr::Boxed),
                };
                vals.push(pad);
            }
        }
        if has_impl {
            let mut parts = Vec::with_capacity(vals.len());
            for (v, r) in vals.iter().zip(impl_reprs.iter()) {
                let c = self.coerce(v, *r);
                parts.push(format!("{} {}", c.repr.llvm(), c.name));
            }
            let t = self.fresh();
            self.line(&format!(
                "{} = call {} @{}_impl({})",
                t,
                impl_ret.llvm(),
                symbol,
                parts.join(", ")
            ));
            Ok(EVal::new(t, impl_ret))
        } else {
            let mut parts = vec![format!("i64 {}", self.cur_self)];
            for v in &vals {
                let b = self.coerce(v, Repr::Boxed);
                parts.push(format!("i64 {}", b.name));
            }
            let t = self.fresh();
            self.line(&format!(
                "{} = call i64 @{}({})",
                t,
                symbol,
                parts.join(", ")
            ));
            Ok(EVal::new(t, Repr::Boxed))
        }
    }


    fn emit_call_method(
        &mut self,
        recv: Option<&ValueId>,
        method: &str,
        args: &[ValueId],
        kwargs: &[(String, ValueId)],
        block_fn: Option<&str>,
    ) -> Result<EVal, String> {
        // logical not inlines over truthiness
        if method == "!" && args.is_empty() && kwargs.is_empty() && block_fn.is_none() {
            if let Some(r) = recv {
                let v = self.value(*r)?;
                let t = self.truthy(&v);
                let out = self.fresh();
                self.line(&format!("{} = xor i1 {}, true", out, t));
                return Ok(EVal::new(out, Repr::I1));
            }
        }

        // operator calls between raw scalars become machine instructions
        if let (Some(r), [a]) = (recv, args) {
            if kwargs.is_empty() && block_fn.is_none() {
                let lv = self.value(*r)?;
                let rv = self.value(*a)?;
                let raw = |x: &EVal| matches!(x.repr, Repr::I64 | Repr::F64);
                if raw(&lv) && raw(&rv) {
                    if let Some(out) = self.emit_inline_op(method, &lv, &rv)? {
                        return Ok(out);
                    }
                }
            }
        }

        // generic path: the host's funcall with an interned method id
        let recv_val = match recv {
            Some(r) => {
                let v = self.value(*r)?;
                self.coerce(&v, Repr::Boxed)
            }
            None => EVal::new(self.cur_self.clone(), Repr::Boxed),
        };
        let mut vals: Vec<EVal> = args
            .iter()
            .map(|v| self.value(*v))
            .collect::<Result<_, _>>()?;
        if !kwargs.is_empty() {
            let h = self.fresh();
            self.line(&format!("{} = call i64 @rb_hash_new()", h));
            for (name, v) in kwargs {
                let sym = self.sym_value(name);
                let val = self.value(*v)?;
                let boxed = self.coerce(&val, Repr::Boxed);
                self.line(&format!(
                    "call i64 @rb_hash_aset(i64 {}, i64 {}, i64 {})",
                    h, sym, boxed.name
                ));
            }
            vals.push(EVal::new(h, Repr::Boxed));
        }
        let argv = self.argv_array(&vals);
        let mid = self.intern(method);
        let t = self.fresh();
        match block_fn {
            Some(bf) => {
                let env = self
                    .cur_env
                    .clone()
                    .ok_or("block call outside an environment-carrying function")?;
                let sym = symbol_for(bf);
                self.line(&format!(
                    "{} = call i64 @rb_block_call(i64 {}, i64 {}, i32 {}, ptr {}, ptr @{}, i64 {})",
                    t,
                    recv_val.name,
                    mid,
                    vals.len(),
                    argv,
                    sym,
                    env
                ));
            }
            None => {
                self.line(&format!(
                    "{} = call i64 @rb_funcallv(i64 {}, i64 {}, i32 {}, ptr {})",
                    t,
                    recv_val.name,
                    mid,
                    vals.len(),
                    argv
                ));
            }
        }
        Ok(EVal::new(t, Repr::Boxed))
    }

    /// Inline arithmetic and comparison over raw scalars; `None` when the
    /// operator has no inline form and must go through dispatch.
    fn emit_inline_op(
        &mut self,
        method: &str,
        lv: &EVal,
        rv: &EVal,
    ) -> Result<Option<EVal>, String> {
        let float = lv.repr == Repr::F64 || rv.repr == Repr::F64;
        if float {
            let l = self.coerce(lv, Repr::F64);
            let r = self.coerce(rv, Repr::F64);
            let (op, cmp) = match method {
                "+" => ("fadd", None),
                "-" => ("fsub", None),
                "*" => ("fmul", None),
                "/" => ("fdiv", None),
                "%" => ("frem", None),
                "<" => ("", Some("olt")),
                "<=" => ("", Some("ole")),
                ">" => ("", Some("ogt")),
                ">=" => ("", Some("oge")),
                "==" => ("", Some("oeq")),
                "!=" => ("", Some("une")),
                _ => return Ok(None),
            };
            let t = self.fresh();
            if let Some(c) = cmp {
                self.line(&format!(
                    "{} = fcmp {} double {}, {}",
                    t, c, l.name, r.name
                ));
                return Ok(Some(EVal::new(t, Repr::I1)));
            }
            self.line(&format!("{} = {} double {}, {}", t, op, l.name, r.name));
            return Ok(Some(EVal::new(t, Repr::F64)));
        }

        let l = self.coerce(lv, Repr::I64);
        let r = self.coerce(rv, Repr::I64);
        match method {
            "+" | "-" | "*" | "&" | "|" | "^" | "<<" | ">>" => {
                let op = match method {
                    "+" => "add",
                    "-" => "sub",
                    "*" => "mul",
                    "&" => "and",
                    "|" => "or",
                    "^" => "xor",
                    "<<" => "shl",
                    _ => "ashr",
                };
                let t = self.fresh();
                self.line(&format!("{} = {} i64 {}, {}", t, op, l.name, r.name));
                Ok(Some(EVal::new(t, Repr::I64)))
            }
            "<" | "<=" | ">" | ">=" | "==" | "!=" => {
                let c = match method {
                    "<" => "slt",
                    "<=" => "sle",
                    ">" => "sgt",
                    ">=" => "sge",
                    "==" => "eq",
                    _ => "ne",
                };
                let t = self.fresh();
                self.line(&format!("{} = icmp {} i64 {}, {}", t, c, l.name, r.name));
                Ok(Some(EVal::new(t, Repr::I1)))
            }
            "/" | "%" => Ok(Some(self.emit_int_div(method, &l, &r))),
            _ => Ok(None),
        }
    }

    /// Integer division with host semantics: a zero divisor raises, and the
    /// quotient floors toward negative infinity.
    fn emit_int_div(&mut self, method: &str, l: &EVal, r: &EVal) -> EVal {
        let n = {
            let t = self.fresh();
            t.trim_start_matches("%t").parse::<usize>().unwrap_or(0)
        };
        let zero_l = format!("divzero{}", n);
        let ok_l = format!("divok{}", n);
        let isz = self.fresh();
        self.line(&format!("{} = icmp eq i64 {}, 0", isz, r.name));
        self.line(&format!(
            "br i1 {}, label %{}, label %{}",
            isz, zero_l, ok_l
        ));
        self.label(&zero_l);
        let cls = self.fresh();
        self.line(&format!("{} = load i64, ptr @rb_eZeroDivError", cls));
        let fmt = self.string_global("%s");
        let msg = self.string_global("divided by 0");
        self.line(&format!(
            "call void (i64, ptr, ...) @rb_raise(i64 {}, ptr {}, ptr {})",
            cls, fmt, msg
        ));
        self.line("unreachable");
        self.split_to(ok_l);

        let q = self.fresh();
        self.line(&format!("{} = sdiv i64 {}, {}", q, l.name, r.name));
        let rem = self.fresh();
        self.line(&format!("{} = srem i64 {}, {}", rem, l.name, r.name));
        let rnz = self.fresh();
        self.line(&format!("{} = icmp ne i64 {}, 0", rnz, rem));
        let rneg = self.fresh();
        self.line(&format!("{} = icmp slt i64 {}, 0", rneg, rem));
        let dneg = self.fresh();
        self.line(&format!("{} = icmp slt i64 {}, 0", dneg, r.name));
        let sx = self.fresh();
        self.line(&format!("{} = xor i1 {}, {}", sx, rneg, dneg));
        let adj = self.fresh();
        self.line(&format!("{} = and i1 {}, {}", adj, rnz, sx));
        if method == "/" {
            let adj64 = self.fresh();
            self.line(&format!("{} = zext i1 {} to i64", adj64, adj));
            let out = self.fresh();
            self.line(&format!("{} = sub i64 {}, {}", out, q, adj64));
            EVal::new(out, Repr::I64)
        } else {
            let addend = self.fresh();
            self.line(&format!(
                "{} = select i1 {}, i64 {}, i64 0",
                addend, adj, r.name
            ));
            let out = self.fresh();
            self.line(&format!("{} = add i64 {}, {}", out, rem, addend));
            EVal::new(out, Repr::I64)
        }
    }

    fn emit_native_call(
        &mut self,
        class: &str,
        method: &str,
        recv: ValueId,
        args: &[ValueId],
        vtable: bool,
    ) -> Result<EVal, String> {
        let r = self.value(recv)?;
        let rb = self.coerce(&r, Repr::Boxed);
        let vals: Vec<EVal> = args
            .iter()
            .map(|v| self.value(*v))
            .collect::<Result<_, _>>()?;
        let mut parts = vec![format!("i64 {}", rb.name)];
        for v in &vals {
            let b = self.coerce(v, Repr::Boxed);
            parts.push(format!("i64 {}", b.name));
        }

        if vtable {
            // dispatch through the vptr in the struct's first slot; the
            // slot index is stable across the inheritance chain
            let slots = self.registry.vtable_layout(class);
            let slot = slots
                .iter()
                .position(|m| m == method)
                .ok_or_else(|| {
                    format!("vtable class '{}' has no slot for '{}'", class, method)
                })?;
            self.extra_decls.insert(format!(
                "@kp_{}_data_type = external global i8",
                mangle(class)
            ));
            let p = self.fresh();
            self.line(&format!(
                "{} = call ptr @rb_check_typeddata(i64 {}, ptr @kp_{}_data_type)",
                p,
                rb.name,
                mangle(class)
            ));
            let vptr = self.fresh();
            self.line(&format!("{} = load ptr, ptr {}", vptr, p));
            let slotp = self.fresh();
            self.line(&format!(
                "{} = getelementptr ptr, ptr {}, i64 {}",
                slotp, vptr, slot
            ));
            let fp = self.fresh();
            self.line(&format!("{} = load ptr, ptr {}", fp, slotp));
            let t = self.fresh();
            self.line(&format!("{} = call i64 {}({})", t, fp, parts.join(", ")));
            return Ok(EVal::new(t, Repr::Boxed));
        }

        // non-vtable native method: a direct call to the compiled method
        let key = format!("{}#{}", class, method);
        match self.fn_symbol(&key) {
            Some(sym) => {
                let t = self.fresh();
                self.line(&format!("{} = call i64 @{}({})", t, sym, parts.join(", ")));
                Ok(EVal::new(t, Repr::Boxed))
            }
            None => {
                // method body not in this unit: declared native symbol
                let sym = format!("kp_{}_{}", mangle(class), mangle(method));
                let sig: Vec<&str> = parts.iter().map(|_| "i64").collect();
                self.extra_decls
                    .insert(format!("declare i64 @{}({})", sym, sig.join(", ")));
                let t = self.fresh();
                self.line(&format!("{} = call i64 @{}({})", t, sym, parts.join(", ")));
                Ok(EVal::new(t, Repr::Boxed))
            }
        }
    }
}
