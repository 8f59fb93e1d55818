//! Loop-invariant code motion
//!
//! Loops are discovered from back edges under dominator analysis (an edge
//! whose target dominates its source). An instruction hoists to the loop's
//! preheader when its opcode is on the pure allowlist — or is an
//! `Op::ArrayLen` / pure arithmetic call whose receiver is never touched by
//! an impure operation inside the loop — and every operand is defined
//! outside the loop. Impure calls never hoist.

use crate::hir::validate::{dominators, predecessors, reachable_blocks, term_targets};
use crate::hir::*;
use crate::types::Type;
use std::collections::{HashMap, HashSet};

pub fn run(program: &mut Program) -> Result<(), String> {
    for f in &mut program.functions {
        hoist_function(f);
    }
    Ok(())
}

struct Loop {
    header: String,
    body: HashSet<String>,
    preheader: String,
}

fn hoist_function(f: &mut Function) {
    let loops = find_loops(f);
    for lp in loops {
        hoist_loop(f, &lp);
    }
}

fn find_loops(f: &Function) -> Vec<Loop> {
    let reachable = reachable_blocks(f);
    let preds = predecessors(f);
    let doms = dominators(f, &reachable, &preds);

    let mut loops = Vec::new();
    for b in &f.blocks {
        if !reachable.contains(b.label.as_str()) {
            continue;
        }
        for target in term_targets(&b.term) {
            // back edge: target dominates source
            let is_back = doms
                .get(b.label.as_str())
                .map(|d| d.contains(target))
                .unwrap_or(false);
            if !is_back {
                continue;
            }
            let body = natural_loop(f, target, &b.label, &preds);
            // the preheader is the unique out-of-loop predecessor of the
            // header; the lowering always creates one
            let preheader = preds
                .get(target)
                .and_then(|ps| {
                    let outside: Vec<&&str> =
                        ps.iter().filter(|p| !body.contains(**p)).collect();
                    if outside.len() == 1 {
                        Some(outside[0].to_string())
                    } else {
                        None
                    }
                });
            if let Some(preheader) = preheader {
                loops.push(Loop {
                    header: target.to_string(),
                    body,
                    preheader,
                });
            }
        }
    }
    loops
}

/// Nodes of the natural loop of back edge `latch -> header`.
fn natural_loop(
    _f: &Function,
    header: &str,
    latch: &str,
    preds: &HashMap<&str, HashSet<&str>>,
) -> HashSet<String> {
    let mut body: HashSet<String> = [header.to_string(), latch.to_string()].into();
    let mut stack = vec![latch.to_string()];
    while let Some(n) = stack.pop() {
        if n == header {
            continue;
        }
        if let Some(ps) = preds.get(n.as_str()) {
            for p in ps {
                if body.insert(p.to_string()) {
                    stack.push(p.to_string());
                }
            }
        }
    }
    body
}

/// Pure method names whose zero-argument form may hoist when the receiver
/// is not mutated inside the loop.
fn pure_method(name: &str, argc: usize) -> bool {
    match name {
        "length" | "size" | "abs" | "to_i" | "to_f" | "to_s" => argc == 0,
        "+" | "-" | "*" | "/" | "%" | "<" | "<=" | ">" | ">=" | "==" | "!=" => argc == 1,
        _ => false,
    }
}

fn hoist_loop(f: &mut Function, lp: &Loop) {
    // values defined inside the loop
    let mut defined_in: HashSet<ValueId> = HashSet::new();
    for b in &f.blocks {
        if lp.body.contains(&b.label) {
            for i in &b.instrs {
                defined_in.insert(i.dst);
            }
        }
    }

    // receivers touched by impure operations inside the loop; `length` of
    // such a value must not move
    let mut mutated: HashSet<ValueId> = HashSet::new();
    let types = f.value_types();
    for b in &f.blocks {
        if !lp.body.contains(&b.label) {
            continue;
        }
        for i in &b.instrs {
            let impure_call = match &i.op {
                Op::CallMethod { method, args, .. } => !pure_method(method, args.len()),
                Op::CallFn { .. }
                | Op::SuperCall { .. }
                | Op::NativeCall { .. }
                | Op::CfuncCall { .. }
                | Op::YieldBlock { .. }
                | Op::FiberYield { .. }
                | Op::Rescue { .. } => true,
                _ => false,
            };
            if impure_call {
                for v in i.op.operands() {
                    mutated.insert(v);
                }
            }
        }
    }

    loop {
        let mut moved = false;
        for bi in 0..f.blocks.len() {
            if !lp.body.contains(&f.blocks[bi].label) {
                continue;
            }
            let mut ii = 0;
            while ii < f.blocks[bi].instrs.len() {
                let instr = &f.blocks[bi].instrs[ii];
                if can_hoist(instr, &defined_in, &mutated, &types) {
                    let instr = f.blocks[bi].instrs.remove(ii);
                    defined_in.remove(&instr.dst);
                    let pre = f
                        .blocks
                        .iter_mut()
                        .find(|b| b.label == lp.preheader)
                        .expect("preheader block exists");
                    pre.instrs.push(instr);
                    moved = true;
                } else {
                    ii += 1;
                }
            }
        }
        if !moved {
            break;
        }
    }
}

fn can_hoist(
    instr: &Instr,
    defined_in: &HashSet<ValueId>,
    mutated: &HashSet<ValueId>,
    types: &HashMap<ValueId, Type>,
) -> bool {
    let operands_external = instr.op.operands().iter().all(|v| !defined_in.contains(v));
    if !operands_external {
        return false;
    }
    match &instr.op {
        op if op.is_pure() => {
            if let Op::ArrayLen(v) = op {
                !mutated.contains(v)
            } else {
                true
            }
        }
        Op::CallMethod { recv: Some(r), method, args, kwargs, block_fn, .. } => {
            if !kwargs.is_empty() || block_fn.is_some() {
                return false;
            }
            if !pure_method(method, args.len()) {
                return false;
            }
            if mutated.contains(r) {
                return false;
            }
            // arithmetic on loop-external unboxed values, or length-like
            // queries of untouched receivers
            match method.as_str() {
                "length" | "size" => true,
                _ => {
                    let recv_unboxed = types
                        .get(r)
                        .map(Type::is_unboxed_scalar)
                        .unwrap_or(false);
                    recv_unboxed
                }
            }
        }
        _ => false,
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

    // while i < n: acc = acc + (10 * 20); i = i + 1
    // the constant product hoists, the loop-carried adds stay
    fn loopy_json() -> &'static str {
        r#"{"body": [{"kind": "def", "name": "work",
             "params": {"list": [{"name": "n"}]},
             "body": [
               {"kind": "assign", "target": {"kind": "lvar", "name": "i"},
                "value": {"kind": "int", "value": 0}},
               {"kind": "assign", "target": {"kind": "lvar", "name": "acc"},
                "value": {"kind": "int", "value": 0}},
               {"kind": "while",
                "cond": {"kind": "call", "receiver": {"kind": "lvar", "name": "i"},
                         "name": "<", "args": [{"kind": "lvar", "name": "n"}]},
                "body": [
                  {"kind": "assign", "target": {"kind": "lvar", "name": "acc"},
                   "value": {"kind": "call",
                             "receiver": {"kind": "lvar", "name": "acc"},
                             "name": "+",
                             "args": [{"kind": "call",
                                       "receiver": {"kind": "int", "value": 10},
                                       "name": "*",
                                       "args": [{"kind": "int", "value": 20}]}]}},
                  {"kind": "assign", "target": {"kind": "lvar", "name": "i"},
                   "value": {"kind": "call", "receiver": {"kind": "lvar", "name": "i"},
                             "name": "+", "args": [{"kind": "int", "value": 1}]}}]}]}]}"#
    }

    #[test]
    fn test_finds_lowered_loop() {
        let p = build_hir(loopy_json());
        let f = p.function("work").unwrap();
        let loops = find_loops(f);
        assert_eq!(loops.len(), 1);
        assert!(loops[0].header.starts_with("loopcond"));
        assert!(loops[0].preheader.starts_with("preheader"));
    }

    #[test]
    fn test_hoists_constant_product_into_preheader() {
        let mut p = build_hir(loopy_json());
        run(&mut p).unwrap();
        let f = p.function("work").unwrap();
        let pre = f
            .blocks
            .iter()
            .find(|b| b.label.starts_with("preheader"))
            .unwrap();
        // the 10 * 20 multiplication (and its constant operands) moved out
        assert!(
            pre.instrs
                .iter()
                .any(|i| matches!(&i.op, Op::CallMethod { method, .. } if method == "*")),
            "constant product should hoist to the preheader"
        );
        validate::validate(&p).expect("hoisted HIR stays valid");
    }

    #[test]
    fn test_loop_carried_add_stays() {
        let mut p = build_hir(loopy_json());
        run(&mut p).unwrap();
        let f = p.function("work").unwrap();
        let body_blocks: Vec<&Block> = f
            .blocks
            .iter()
            .filter(|b| b.label.starts_with("loopbody"))
            .collect();
        let adds_in_body = body_blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter(|i| matches!(&i.op, Op::CallMethod { method, .. } if method == "+"))
            .count();
        assert!(adds_in_body >= 1, "loop-carried additions must not hoist");
    }
}
