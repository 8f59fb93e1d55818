//! Inliner
//!
//! Candidates are top-level functions with at most `MAX_INLINE_INSTRS`
//! instructions that sit in no recursive cycle; `__main__` and class
//! methods are never candidates, and neither are variadic or
//! environment-carrying functions. Inlining substitutes parameters for
//! argument operands and rewrites every `return` into a jump-with-value
//! into the caller's continuation block. Repeated passes bound the
//! inlining depth.

use super::call_graph::CallGraph;
use crate::hir::*;
use crate::types::Type;
use std::collections::{HashMap, HashSet};

const MAX_INLINE_INSTRS: usize = 10;
const MAX_INLINE_DEPTH: usize = 3;

pub fn run(program: &mut Program) -> Result<(), String> {
    for depth in 0..MAX_INLINE_DEPTH {
        let graph = CallGraph::build(program);
        let candidates: HashSet<String> = program
            .functions
            .iter()
            .filter(|f| is_candidate(f, &graph))
            .map(|f| f.key.clone())
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let bodies: HashMap<String, FunctionSnapshot> = program
            .functions
            .iter()
            .filter(|f| candidates.contains(&f.key))
            .map(|f| (f.key.clone(), snapshot(f)))
            .collect();

        let mut changed = false;
        for f in &mut program.functions {
            // a candidate's own body is left alone this pass; it may still
            // be inlined elsewhere
            changed |= inline_into(f, &bodies);
        }
        if !changed {
            return Ok(());
        }
        tracing::debug!(pass = depth + 1, "inliner pass rewrote call sites");
    }
    Ok(())
}

fn is_candidate(f: &Function, graph: &CallGraph) -> bool {
    f.owner.is_none()
        && f.kind == FnKind::Plain
        && f.key != "__main__"
        && !f.variadic
        && !f.env_locals
        && f.instr_count() <= MAX_INLINE_INSTRS
        && !graph.is_recursive(&f.key)
}

/// What we need to splice a callee into a caller.
struct FunctionSnapshot {
    params: Vec<FnParam>,
    locals: Vec<LocalDecl>,
    ret_slot: LocalId,
    blocks: Vec<Block>,
    entry: String,
    max_value: ValueId,
}

fn snapshot(f: &Function) -> FunctionSnapshot {
    let max_value = f
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter().map(|i| i.dst))
        .max()
        .map(|v| v + 1)
        .unwrap_or(0);
    FunctionSnapshot {
        params: f.params.clone(),
        locals: f.locals.clone(),
        ret_slot: f.ret_slot,
        blocks: f.blocks.clone(),
        entry: f.entry.clone(),
        max_value,
    }
}

fn inline_into(caller: &mut Function, bodies: &HashMap<String, FunctionSnapshot>) -> bool {
    let mut changed = false;
    // label prefixes must stay unique across repeated passes
    let mut n = caller
        .blocks
        .iter()
        .filter_map(|b| {
            b.label
                .strip_prefix("inl")
                .and_then(|r| r.split('_').next())
                .and_then(|d| d.parse::<usize>().ok())
        })
        .max()
        .map(|m| m + 1)
        .unwrap_or(0);
    loop {
        // find the next inlinable call site
        let site = caller.blocks.iter().enumerate().find_map(|(bi, b)| {
            b.instrs.iter().enumerate().find_map(|(ii, instr)| {
                if let Op::CallFn { key, .. } = &instr.op {
                    if bodies.contains_key(key) && key != &caller.key {
                        return Some((bi, ii));
                    }
                }
                None
            })
        });
        let Some((bi, ii)) = site else { return changed };

        let block = caller.blocks[bi].clone();
        let instr = block.instrs[ii].clone();
        let Op::CallFn { key, args } = instr.op else { unreachable!() };
        let callee = &bodies[&key];

        let value_base = caller
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter().map(|i| i.dst))
            .max()
            .map(|v| v + 1)
            .unwrap_or(0)
            .max(instr.dst + 1);
        let local_base = caller.locals.len();
        let prefix = format!("inl{}_", n);
        n += 1;

        // callee locals join the caller frame
        for l in &callee.locals {
            caller.locals.push(LocalDecl {
                name: format!("{}{}", prefix, l.name),
                ty: l.ty.clone(),
            });
        }

        let cont_label = format!("{}cont", prefix);

        // head: instructions before the call, spill arguments into the
        // callee's parameter slots, jump into the callee entry
        let mut head = Block {
            label: block.label.clone(),
            instrs: block.instrs[..ii].to_vec(),
            term: Terminator::Jump(format!("{}{}", prefix, callee.entry)),
        };
        let mut spill_value = value_base;
        for (p, arg) in callee.params.iter().zip(args.iter()) {
            head.instrs.push(Instr {
                dst: spill_value,
                op: Op::StoreLocal(p.local + local_base, *arg),
                ty: Type::Unit,
            });
            spill_value += 1;
        }

        // continuation: the call's result is the callee's return slot
        let mut cont = Block {
            label: cont_label.clone(),
            instrs: vec![Instr {
                dst: instr.dst,
                op: Op::LoadLocal(callee.ret_slot + local_base),
                ty: instr.ty.clone(),
            }],
            term: block.term.clone(),
        };
        cont.instrs.extend_from_slice(&block.instrs[ii + 1..]);

        // splice callee blocks with remapped values, locals, and labels
        let mut spliced = Vec::with_capacity(callee.blocks.len());
        for cb in &callee.blocks {
            let mut nb = Block {
                label: format!("{}{}", prefix, cb.label),
                instrs: Vec::with_capacity(cb.instrs.len()),
                term: remap_term(&cb.term, &prefix, spill_value + callee.max_value, &cont_label),
            };
            for i in &cb.instrs {
                nb.instrs.push(Instr {
                    dst: i.dst + spill_value,
                    op: remap_op(&i.op, spill_value, local_base, &prefix),
                    ty: i.ty.clone(),
                });
            }
            // a return rewrites to a store of the returned value into the
            // callee's return slot followed by the continuation jump
            if let Terminator::Return(v) = &cb.term {
                nb.instrs.push(Instr {
                    dst: spill_value + callee.max_value,
                    op: Op::StoreLocal(callee.ret_slot + local_base, v + spill_value),
                    ty: Type::Unit,
                });
            }
            spliced.push(nb);
        }

        caller.blocks[bi] = head;
        caller.blocks.insert(bi + 1, cont);
        for (k, b) in spliced.into_iter().enumerate() {
            caller.blocks.insert(bi + 2 + k, b);
        }
        changed = true;
    }
}

fn remap_term(
    t: &Terminator,
    prefix: &str,
    _store_value: ValueId,
    cont_label: &str,
) -> Terminator {
    match t {
        Terminator::Jump(l) => Terminator::Jump(format!("{}{}", prefix, l)),
        Terminator::Branch { cond, then_label, else_label } => Terminator::Branch {
            cond: *cond,
            then_label: format!("{}{}", prefix, then_label),
            else_label: format!("{}{}", prefix, else_label),
        },
        Terminator::Return(_) => Terminator::Jump(cont_label.to_string()),
        Terminator::Raise(k) => Terminator::Raise(k.clone()),
    }
}

fn remap_op(op: &Op, value_off: ValueId, local_off: usize, prefix: &str) -> Op {
    let v = |x: &ValueId| *x + value_off;
    match op {
        Op::LoadLocal(l) => Op::LoadLocal(l + local_off),
        Op::StoreLocal(l, x) => Op::StoreLocal(l + local_off, v(x)),
        Op::StoreGvar(n, x) => Op::StoreGvar(n.clone(), v(x)),
        Op::StoreIvar(n, x) => Op::StoreIvar(n.clone(), v(x)),
        Op::StoreCvar(n, x) => Op::StoreCvar(n.clone(), v(x)),
        Op::StoreConst(n, x) => Op::StoreConst(n.clone(), v(x)),
        Op::ArrayNew(items) => Op::ArrayNew(items.iter().map(|x| v(x)).collect()),
        Op::HashNew(pairs) => {
            Op::HashNew(pairs.iter().map(|(k, x)| (v(k), v(x))).collect())
        }
        Op::RangeNew { low, high, exclusive } => Op::RangeNew {
            low: v(low),
            high: v(high),
            exclusive: *exclusive,
        },
        Op::CallMethod { recv, method, args, kwargs, block_fn, safe } => Op::CallMethod {
            recv: recv.as_ref().map(|x| v(x)),
            method: method.clone(),
            args: args.iter().map(|x| v(x)).collect(),
            kwargs: kwargs.iter().map(|(k, x)| (k.clone(), v(x))).collect(),
            block_fn: block_fn.clone(),
            safe: *safe,
        },
        Op::CallFn { key, args } => Op::CallFn {
            key: key.clone(),
            args: args.iter().map(|x| v(x)).collect(),
        },
        Op::SuperCall { args } => Op::SuperCall {
            args: args.iter().map(|x| v(x)).collect(),
        },
        Op::NativeCall { class, method, recv, args, vtable } => Op::NativeCall {
            class: class.clone(),
            method: method.clone(),
            recv: v(recv),
            args: args.iter().map(|x| v(x)).collect(),
            vtable: *vtable,
        },
        Op::CfuncCall { symbol, recv, args } => Op::CfuncCall {
            symbol: symbol.clone(),
            recv: v(recv),
            args: args.iter().map(|x| v(x)).collect(),
        },
        Op::YieldBlock { args } => Op::YieldBlock {
            args: args.iter().map(|x| v(x)).collect(),
        },
        Op::FiberYield { args } => Op::FiberYield {
            args: args.iter().map(|x| v(x)).collect(),
        },
        Op::KindOf { value, class_name } => Op::KindOf {
            value: v(value),
            class_name: class_name.clone(),
        },
        Op::ValueEq { lhs, rhs } => Op::ValueEq { lhs: v(lhs), rhs: v(rhs) },
        Op::ArrayLen(x) => Op::ArrayLen(v(x)),
        Op::ArrayGet { ary, index } => Op::ArrayGet { ary: v(ary), index: *index },
        Op::ArraySlice { ary, start, drop_back } => Op::ArraySlice {
            ary: v(ary),
            start: *start,
            drop_back: *drop_back,
        },
        Op::ToArray(x) => Op::ToArray(v(x)),
        Op::HashHasKey { hash, key } => Op::HashHasKey { hash: v(hash), key: key.clone() },
        Op::HashGetSym { hash, key } => Op::HashGetSym { hash: v(hash), key: key.clone() },
        Op::KwLookup { hash, name } => Op::KwLookup { hash: v(hash), name: name.clone() },
        Op::IsUndef(x) => Op::IsUndef(v(x)),
        Op::Phi { incomings } => Op::Phi {
            incomings: incomings
                .iter()
                .map(|(l, x)| (format!("{}{}", prefix, l), v(x)))
                .collect(),
        },
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::hir::{lower, validate};
    use crate::sig::SignatureRegistry;
    use crate::tast;

    fn build_hir(json: &str) -> Program {
        let root = Root::from_json(json).unwrap();
        let registry = SignatureRegistry::new();
        let mut tp = tast::build::build(&root, &registry).unwrap();
        crate::infer::run(&mut tp).unwrap();
        lower::lower(&tp).unwrap()
    }

    #[test]
    fn test_small_function_inlined_into_caller() {
        let mut p = build_hir(
            r#"{"body": [
                 {"kind": "def", "name": "double",
                  "params": {"list": [{"name": "x"}]},
                  "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "x"},
                            "name": "*", "args": [{"kind": "int", "value": 2}]}]},
                 {"kind": "def", "name": "use", "params": {"list": []},
                  "body": [{"kind": "call", "receiver": null, "name": "double",
                            "args": [{"kind": "int", "value": 21}]}]}]}"#,
        );
        run(&mut p).unwrap();
        let user = p.function("use").unwrap();
        let has_callfn = user.blocks.iter().any(|b| {
            b.instrs
                .iter()
                .any(|i| matches!(&i.op, Op::CallFn { key, .. } if key == "double"))
        });
        assert!(!has_callfn, "call site should have been inlined");
        validate::validate(&p).expect("inlined HIR stays valid");
    }

    #[test]
    fn test_recursive_function_not_inlined() {
        let mut p = build_hir(
            r#"{"body": [
                 {"kind": "def", "name": "loopy",
                  "params": {"list": [{"name": "n"}]},
                  "body": [{"kind": "call", "receiver": null, "name": "loopy",
                            "args": [{"kind": "lvar", "name": "n"}]}]},
                 {"kind": "def", "name": "use", "params": {"list": []},
                  "body": [{"kind": "call", "receiver": null, "name": "loopy",
                            "args": [{"kind": "int", "value": 1}]}]}]}"#,
        );
        run(&mut p).unwrap();
        let user = p.function("use").unwrap();
        let has_callfn = user.blocks.iter().any(|b| {
            b.instrs
                .iter()
                .any(|i| matches!(&i.op, Op::CallFn { key, .. } if key == "loopy"))
        });
        assert!(has_callfn, "recursive callee must stay a call");
    }

    #[test]
    fn test_main_never_inlined() {
        let mut p = build_hir(
            r#"{"body": [{"kind": "int", "value": 1}]}"#,
        );
        // __main__ exists and is tiny, but is never a candidate
        let graph = CallGraph::build(&p);
        let main = p.function("__main__").unwrap();
        assert!(!is_candidate(main, &graph));
        run(&mut p).unwrap();
    }
}
