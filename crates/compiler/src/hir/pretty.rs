//! Human-readable HIR dump, for debugging and tests.

use super::*;
use std::fmt::Write as _;

/// Render the whole program.
pub fn program(p: &Program) -> String {
    let mut out = String::new();
    for c in &p.classes {
        let _ = writeln!(
            out,
            "class {}{}{}",
            c.name,
            c.superclass
                .as_ref()
                .map(|s| format!(" < {}", s))
                .unwrap_or_default(),
            if c.reopened { " (reopened)" } else { "" }
        );
    }
    for m in &p.modules {
        let _ = writeln!(out, "module {}", m.name);
    }
    for f in &p.functions {
        out.push_str(&function(f));
        out.push('\n');
    }
    out
}

/// Render one function.
pub fn function(f: &Function) -> String {
    let mut out = String::new();
    let params: Vec<String> = f
        .params
        .iter()
        .map(|p| format!("{}: {}", p.name, p.ty))
        .collect();
    let _ = writeln!(
        out,
        "fn {}({}) -> {}{}{}",
        f.key,
        params.join(", "),
        f.ret_ty,
        if f.variadic { " variadic" } else { "" },
        if f.env_locals { " env" } else { "" },
    );
    for b in &f.blocks {
        let _ = writeln!(out, "{}:", b.label);
        for i in &b.instrs {
            let _ = writeln!(out, "  %{} = {} : {}", i.dst, op(&i.op), i.ty);
        }
        let _ = writeln!(out, "  {}", term(&b.term));
    }
    out
}

fn vals(vs: &[ValueId]) -> String {
    vs.iter()
        .map(|v| format!("%{}", v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn op(o: &Op) -> String {
    match o {
        Op::ConstInt(v) => format!("int {}", v),
        Op::ConstFloat(v) => format!("float {}", v),
        Op::ConstStr(s) => format!("str {:?}", s),
        Op::ConstSym(s) => format!("sym :{}", s),
        Op::ConstBool(b) => format!("bool {}", b),
        Op::ConstNil => "nil".to_string(),
        Op::SelfVal => "self".to_string(),
        Op::LoadLocal(i) => format!("load l{}", i),
        Op::StoreLocal(i, v) => format!("store l{}, %{}", i, v),
        Op::LoadEnv(i) => format!("envload {}", i),
        Op::StoreEnv(i, v) => format!("envstore {}, %{}", i, v),
        Op::LoadGvar(n) => format!("gvar {}", n),
        Op::StoreGvar(n, v) => format!("gvar {} = %{}", n, v),
        Op::LoadIvar(n) => format!("ivar {}", n),
        Op::StoreIvar(n, v) => format!("ivar {} = %{}", n, v),
        Op::LoadCvar(n) => format!("cvar {}", n),
        Op::StoreCvar(n, v) => format!("cvar {} = %{}", n, v),
        Op::LoadConst(n) => format!("const {}", n),
        Op::StoreConst(n, v) => format!("const {} = %{}", n, v),
        Op::ArrayNew(items) => format!("array [{}]", vals(items)),
        Op::HashNew(pairs) => {
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("%{} => %{}", k, v))
                .collect();
            format!("hash {{{}}}", inner.join(", "))
        }
        Op::RangeNew { low, high, exclusive } => {
            format!("range %{}{}%{}", low, if *exclusive { "..." } else { ".." }, high)
        }
        Op::RegexpNew(s) => format!("regexp /{}/", s),
        Op::CallMethod { recv, method, args, block_fn, safe, .. } => format!(
            "call{} {}{}({}){}",
            if *safe { "?" } else { "" },
            recv.map(|r| format!("%{}.", r)).unwrap_or_default(),
            method,
            vals(args),
            block_fn
                .as_ref()
                .map(|b| format!(" block={}", b))
                .unwrap_or_default(),
        ),
        Op::CallFn { key, args } => format!("callfn {}({})", key, vals(args)),
        Op::SuperCall { args } => format!("super({})", vals(args)),
        Op::NativeCall { class, method, recv, args, vtable } => format!(
            "native{} %{}.{}#{}({})",
            if *vtable { "[vtable]" } else { "" },
            recv,
            class,
            method,
            vals(args)
        ),
        Op::CfuncCall { symbol, recv, args } => {
            format!("cfunc {}(%{}, {})", symbol, recv, vals(args))
        }
        Op::ProcNew { body_fn, is_lambda } => {
            format!("proc {} lambda={}", body_fn, is_lambda)
        }
        Op::YieldBlock { args } => format!("yield({})", vals(args)),
        Op::FiberNew { body_fn } => format!("fiber {}", body_fn),
        Op::FiberYield { args } => format!("fiber_yield({})", vals(args)),
        Op::KindOf { value, class_name } => format!("kind_of %{}, {}", value, class_name),
        Op::ValueEq { lhs, rhs } => format!("eq %{}, %{}", lhs, rhs),
        Op::ArrayLen(v) => format!("alen %{}", v),
        Op::ArrayGet { ary, index } => format!("aget %{}[{}]", ary, index),
        Op::ArraySlice { ary, start, drop_back } => {
            format!("aslice %{}[{}..-{}]", ary, start, drop_back)
        }
        Op::ToArray(v) => format!("to_ary %{}", v),
        Op::HashHasKey { hash, key } => format!("haskey %{}, :{}", hash, key),
        Op::HashGetSym { hash, key } => format!("hget %{}, :{}", hash, key),
        Op::KwLookup { hash, name } => format!("kwlookup %{}, :{}", hash, name),
        Op::IsUndef(v) => format!("is_undef %{}", v),
        Op::Rescue { body_fn, arms, else_fn, ensure_fn, .. } => {
            let mut s = format!("rescue body={}", body_fn);
            for a in arms {
                let _ = write!(s, " [{} -> {}]", a.classes.join("|"), a.handler_fn);
            }
            if let Some(e) = else_fn {
                let _ = write!(s, " else={}", e);
            }
            if let Some(e) = ensure_fn {
                let _ = write!(s, " ensure={}", e);
            }
            s
        }
        Op::Phi { incomings } => {
            let inner: Vec<String> = incomings
                .iter()
                .map(|(l, v)| format!("[{}, %{}]", l, v))
                .collect();
            format!("phi {}", inner.join(", "))
        }
    }
}

fn term(t: &Terminator) -> String {
    match t {
        Terminator::Jump(l) => format!("jump {}", l),
        Terminator::Branch { cond, then_label, else_label } => {
            format!("branch %{}, {}, {}", cond, then_label, else_label)
        }
        Terminator::Return(v) => format!("return %{}", v),
        Terminator::Raise(RaiseKind::Value(v)) => format!("raise %{}", v),
        Terminator::Raise(RaiseKind::Rethrow) => "reraise".to_string(),
        Terminator::Raise(RaiseKind::ArgumentError { message }) => {
            format!("raise ArgumentError {:?}", message)
        }
        Terminator::Raise(RaiseKind::NoMatchingPattern { value }) => {
            format!("raise NoMatchingPatternError %{}", value)
        }
    }
}
