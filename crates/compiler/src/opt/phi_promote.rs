//! Phi-type promoter
//!
//! When every incoming value at a merge point carries the same unboxed
//! numeric type, the merge is realized as an LLVM phi over that scalar
//! (i64 or double), avoiding box/unbox round-trips along the edges.
//! Integer-into-float merges promote at compile time when the integer
//! incomings are constants; any other mix falls back to a boxed VALUE phi.

use crate::hir::*;
use crate::types::Type;
use std::collections::HashMap;

pub fn run(program: &mut Program) {
    for f in &mut program.functions {
        promote_function(f);
    }
}

fn promote_function(f: &mut Function) {
    let types = f.value_types();

    // incoming constants eligible for int->float promotion
    let mut const_ints: HashMap<ValueId, i64> = HashMap::new();
    for b in &f.blocks {
        for i in &b.instrs {
            if let Op::ConstInt(v) = i.op {
                const_ints.insert(i.dst, v);
            }
        }
    }

    // decide each phi's realized type
    let mut promote_to_float: Vec<ValueId> = Vec::new();
    for b in &mut f.blocks {
        for i in &mut b.instrs {
            let Op::Phi { incomings } = &i.op else { continue };
            let in_tys: Vec<Type> = incomings
                .iter()
                .map(|(_, v)| types.get(v).cloned().unwrap_or(Type::Value))
                .collect();
            if in_tys.is_empty() {
                continue;
            }
            let homogeneous = in_tys.iter().all(|t| *t == in_tys[0]);
            if homogeneous && in_tys[0].is_unboxed_scalar() {
                i.ty = in_tys[0].clone();
                continue;
            }
            let all_numeric = in_tys
                .iter()
                .all(|t| matches!(t, Type::Int | Type::Float));
            let ints_are_consts = incomings
                .iter()
                .zip(&in_tys)
                .filter(|(_, t)| **t == Type::Int)
                .all(|((_, v), _)| const_ints.contains_key(v));
            if all_numeric && ints_are_consts {
                // promote the constant integer incomings to float
                for ((_, v), t) in incomings.iter().zip(&in_tys) {
                    if *t == Type::Int {
                        promote_to_float.push(*v);
                    }
                }
                i.ty = Type::Float;
            } else {
                // mixed merge: boxed phi
                i.ty = Type::Value;
            }
        }
    }

    for b in &mut f.blocks {
        for i in &mut b.instrs {
            if promote_to_float.contains(&i.dst) {
                if let Op::ConstInt(v) = i.op {
                    i.op = Op::ConstFloat(v as f64);
                    i.ty = Type::Float;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::hir::lower;
    use crate::sig::SignatureRegistry;
    use crate::tast;

    fn build_hir(json: &str, rbs: &str) -> Program {
        let root = Root::from_json(json).unwrap();
        let mut registry = SignatureRegistry::new();
        if !rbs.is_empty() {
            registry.load_document(rbs, "test.rbs").unwrap();
            registry.finalize().unwrap();
        }
        let mut tp = tast::build::build(&root, &registry).unwrap();
        crate::infer::run(&mut tp).unwrap();
        lower::lower(&tp).unwrap()
    }

    fn choose_json() -> &'static str {
        r#"{"body": [{"kind": "def", "name": "choose_int",
             "params": {"list": [{"name": "c"}]},
             "body": [{"kind": "if",
                       "cond": {"kind": "lvar", "name": "c"},
                       "then_body": [{"kind": "int", "value": 10}],
                       "else_body": [{"kind": "int", "value": 20}]}]}]}"#
    }

    #[test]
    fn test_homogeneous_int_merge_promotes() {
        let mut p = build_hir(
            choose_json(),
            "class Object\n  def choose_int: (bool c) -> Integer\nend\n",
        );
        run(&mut p);
        let f = p.function("choose_int").unwrap();
        let phi = f
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .find(|i| matches!(i.op, Op::Phi { .. }))
            .expect("merge phi");
        assert_eq!(phi.ty, Type::Int);
    }

    #[test]
    fn test_mixed_merge_falls_back_to_boxed() {
        let mut p = build_hir(
            r#"{"body": [{"kind": "def", "name": "mixed",
                 "params": {"list": [{"name": "c"}]},
                 "body": [{"kind": "if",
                           "cond": {"kind": "lvar", "name": "c"},
                           "then_body": [{"kind": "int", "value": 1}],
                           "else_body": [{"kind": "str", "value": "s"}]}]}]}"#,
            "",
        );
        run(&mut p);
        let f = p.function("mixed").unwrap();
        let phi = f
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .find(|i| matches!(i.op, Op::Phi { .. }))
            .expect("merge phi");
        assert_eq!(phi.ty, Type::Value);
    }

    #[test]
    fn test_constant_int_into_float_merge_promotes() {
        let mut p = build_hir(
            r#"{"body": [{"kind": "def", "name": "halfway",
                 "params": {"list": [{"name": "c"}]},
                 "body": [{"kind": "if",
                           "cond": {"kind": "lvar", "name": "c"},
                           "then_body": [{"kind": "int", "value": 1}],
                           "else_body": [{"kind": "float", "value": 2.5}]}]}]}"#,
            "",
        );
        run(&mut p);
        let f = p.function("halfway").unwrap();
        let phi = f
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .find(|i| matches!(i.op, Op::Phi { .. }))
            .expect("merge phi");
        assert_eq!(phi.ty, Type::Float);
        // the integer constant itself became a float constant
        let has_converted = f
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .any(|i| matches!(i.op, Op::ConstFloat(v) if (v - 1.0).abs() < f64::EPSILON));
        assert!(has_converted, "constant integer should convert at compile time");
    }
}
