//! HIR validation
//!
//! Enforces the structural invariants the rest of the pipeline relies on:
//! every function is single-entry, every jump target exists, labels are
//! unique, phi incomings name actual predecessors, and every non-terminator
//! operand is defined in a dominating block. Runs after lowering and again
//! after the optimizer mutates the program; malformed HIR is fatal.

use super::*;
use std::collections::{HashMap, HashSet};

/// Validate the whole program.
pub fn validate(program: &Program) -> Result<(), String> {
    for f in &program.functions {
        validate_function(f).map_err(|e| format!("malformed HIR in '{}': {}", f.key, e))?;
    }
    Ok(())
}

/// Validate one function.
pub fn validate_function(f: &Function) -> Result<(), String> {
    let mut labels = HashSet::new();
    for b in &f.blocks {
        if !labels.insert(b.label.as_str()) {
            return Err(format!("duplicate block label '{}'", b.label));
        }
    }
    if !labels.contains(f.entry.as_str()) {
        return Err(format!("entry block '{}' missing", f.entry));
    }

    for b in &f.blocks {
        for target in term_targets(&b.term) {
            if !labels.contains(target) {
                return Err(format!(
                    "block '{}' jumps to unknown label '{}'",
                    b.label, target
                ));
            }
        }
    }

    let reachable = reachable_blocks(f);
    let preds = predecessors(f);
    let doms = dominators(f, &reachable, &preds);

    // definition site of every value
    let mut def_block: HashMap<ValueId, &str> = HashMap::new();
    for b in &f.blocks {
        for i in &b.instrs {
            if def_block.insert(i.dst, b.label.as_str()).is_some() {
                return Err(format!("value %{} defined twice", i.dst));
            }
        }
    }

    for b in &f.blocks {
        if !reachable.contains(b.label.as_str()) {
            continue;
        }
        let mut defined_here: HashSet<ValueId> = HashSet::new();
        for i in &b.instrs {
            if let Op::Phi { incomings } = &i.op {
                for (label, _) in incomings {
                    if !preds
                        .get(b.label.as_str())
                        .map(|p| p.contains(label.as_str()))
                        .unwrap_or(false)
                    {
                        return Err(format!(
                            "phi in '{}' names non-predecessor '{}'",
                            b.label, label
                        ));
                    }
                }
            } else {
                for v in i.op.operands() {
                    check_dominates(f, &doms, &def_block, &defined_here, b, v)?;
                }
            }
            defined_here.insert(i.dst);
        }
        match &b.term {
            Terminator::Branch { cond, .. } => {
                check_dominates(f, &doms, &def_block, &defined_here, b, *cond)?;
            }
            Terminator::Return(v) => {
                check_dominates(f, &doms, &def_block, &defined_here, b, *v)?;
            }
            Terminator::Raise(RaiseKind::Value(v))
            | Terminator::Raise(RaiseKind::NoMatchingPattern { value: v }) => {
                check_dominates(f, &doms, &def_block, &defined_here, b, *v)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_dominates(
    _f: &Function,
    doms: &HashMap<&str, HashSet<&str>>,
    def_block: &HashMap<ValueId, &str>,
    defined_here: &HashSet<ValueId>,
    b: &Block,
    v: ValueId,
) -> Result<(), String> {
    if defined_here.contains(&v) {
        return Ok(());
    }
    let def = def_block
        .get(&v)
        .ok_or_else(|| format!("value %{} used in '{}' but never defined", v, b.label))?;
    if *def == b.label {
        return Err(format!(
            "value %{} used before its definition in '{}'",
            v, b.label
        ));
    }
    let dominated = doms
        .get(b.label.as_str())
        .map(|d| d.contains(def))
        .unwrap_or(false);
    if !dominated {
        return Err(format!(
            "value %{} used in '{}' is defined in non-dominating block '{}'",
            v, b.label, def
        ));
    }
    Ok(())
}

pub fn term_targets(t: &Terminator) -> Vec<&str> {
    match t {
        Terminator::Jump(l) => vec![l.as_str()],
        Terminator::Branch { then_label, else_label, .. } => {
            vec![then_label.as_str(), else_label.as_str()]
        }
        _ => Vec::new(),
    }
}

/// Labels reachable from the entry block.
pub fn reachable_blocks(f: &Function) -> HashSet<&str> {
    let by_label: HashMap<&str, &Block> =
        f.blocks.iter().map(|b| (b.label.as_str(), b)).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![f.entry.as_str()];
    while let Some(l) = stack.pop() {
        if !seen.insert(l) {
            continue;
        }
        if let Some(b) = by_label.get(l) {
            for t in term_targets(&b.term) {
                stack.push(t);
            }
        }
    }
    seen
}

/// Predecessor sets over all blocks.
pub fn predecessors(f: &Function) -> HashMap<&str, HashSet<&str>> {
    let mut preds: HashMap<&str, HashSet<&str>> = HashMap::new();
    for b in &f.blocks {
        for t in term_targets(&b.term) {
            preds.entry(t).or_default().insert(b.label.as_str());
        }
    }
    preds
}

/// Iterative dominator computation over the reachable subgraph. Each
/// block's set contains every block that dominates it (including itself).
pub fn dominators<'a>(
    f: &'a Function,
    reachable: &HashSet<&'a str>,
    preds: &HashMap<&'a str, HashSet<&'a str>>,
) -> HashMap<&'a str, HashSet<&'a str>> {
    let all: HashSet<&str> = reachable.iter().copied().collect();
    let mut doms: HashMap<&str, HashSet<&str>> = HashMap::new();
    for &l in reachable {
        if l == f.entry.as_str() {
            doms.insert(l, [l].into_iter().collect());
        } else {
            doms.insert(l, all.clone());
        }
    }
    let order: Vec<&str> = f
        .blocks
        .iter()
        .map(|b| b.label.as_str())
        .filter(|l| reachable.contains(l))
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &l in &order {
            if l == f.entry.as_str() {
                continue;
            }
            let mut new: Option<HashSet<&str>> = None;
            if let Some(ps) = preds.get(l) {
                for p in ps {
                    if !reachable.contains(p) {
                        continue;
                    }
                    let pd = &doms[p];
                    new = Some(match new {
                        None => pd.clone(),
                        Some(acc) => acc.intersection(pd).copied().collect(),
                    });
                }
            }
            let mut new = new.unwrap_or_default();
            new.insert(l);
            if new != doms[l] {
                doms.insert(l, new);
                changed = true;
            }
        }
    }
    doms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn block(label: &str, instrs: Vec<Instr>, term: Terminator) -> Block {
        Block { label: label.to_string(), instrs, term }
    }

    fn instr(dst: ValueId, op: Op) -> Instr {
        Instr { dst, op, ty: Type::Int }
    }

    fn simple_fn(blocks: Vec<Block>) -> Function {
        Function {
            key: "t".into(),
            name: "t".into(),
            owner: None,
            singleton: false,
            kind: FnKind::Plain,
            params: vec![],
            is_lambda: false,
            variadic: false,
            locals: vec![LocalDecl { name: "__ret".into(), ty: Type::Value }],
            ret_slot: 0,
            env_locals: false,
            ret_ty: Type::Value,
            blocks,
            entry: "entry".into(),
        }
    }

    #[test]
    fn test_valid_straight_line() {
        let f = simple_fn(vec![
            block(
                "entry",
                vec![instr(0, Op::ConstInt(1)), instr(1, Op::StoreLocal(0, 0))],
                Terminator::Jump("exit".into()),
            ),
            block(
                "exit",
                vec![instr(2, Op::LoadLocal(0))],
                Terminator::Return(2),
            ),
        ]);
        assert!(validate_function(&f).is_ok());
    }

    #[test]
    fn test_unknown_jump_target() {
        let f = simple_fn(vec![block("entry", vec![], Terminator::Jump("nowhere".into()))]);
        let err = validate_function(&f).unwrap_err();
        assert!(err.contains("unknown label"));
    }

    #[test]
    fn test_duplicate_label() {
        let f = simple_fn(vec![
            block("entry", vec![instr(0, Op::ConstInt(1))], Terminator::Return(0)),
            block("entry", vec![], Terminator::Jump("entry".into())),
        ]);
        let err = validate_function(&f).unwrap_err();
        assert!(err.contains("duplicate block label"));
    }

    #[test]
    fn test_use_before_definition_across_branches() {
        // value defined in 'then' used in 'merge' without dominating it
        let f = simple_fn(vec![
            block(
                "entry",
                vec![instr(0, Op::ConstBool(true))],
                Terminator::Branch {
                    cond: 0,
                    then_label: "then".into(),
                    else_label: "merge".into(),
                },
            ),
            block("then", vec![instr(1, Op::ConstInt(5))], Terminator::Jump("merge".into())),
            block(
                "merge",
                vec![instr(2, Op::StoreLocal(0, 1))],
                Terminator::Return(2),
            ),
        ]);
        let err = validate_function(&f).unwrap_err();
        assert!(err.contains("non-dominating"), "got: {}", err);
    }

    #[test]
    fn test_phi_requires_predecessor_labels() {
        let f = simple_fn(vec![
            block(
                "entry",
                vec![instr(0, Op::ConstBool(true))],
                Terminator::Branch {
                    cond: 0,
                    then_label: "a".into(),
                    else_label: "b".into(),
                },
            ),
            block("a", vec![instr(1, Op::ConstInt(1))], Terminator::Jump("m".into())),
            block("b", vec![instr(2, Op::ConstInt(2))], Terminator::Jump("m".into())),
            block(
                "m",
                vec![instr(
                    3,
                    Op::Phi {
                        incomings: vec![("a".into(), 1), ("nosuch".into(), 2)],
                    },
                )],
                Terminator::Return(3),
            ),
        ]);
        let err = validate_function(&f).unwrap_err();
        assert!(err.contains("non-predecessor"));
    }

    #[test]
    fn test_valid_diamond_with_phi() {
        let f = simple_fn(vec![
            block(
                "entry",
                vec![instr(0, Op::ConstBool(true))],
                Terminator::Branch {
                    cond: 0,
                    then_label: "a".into(),
                    else_label: "b".into(),
                },
            ),
            block("a", vec![instr(1, Op::ConstInt(1))], Terminator::Jump("m".into())),
            block("b", vec![instr(2, Op::ConstInt(2))], Terminator::Jump("m".into())),
            block(
                "m",
                vec![instr(
                    3,
                    Op::Phi {
                        incomings: vec![("a".into(), 1), ("b".into(), 2)],
                    },
                )],
                Terminator::Return(3),
            ),
        ]);
        assert!(validate_function(&f).is_ok());
    }

    #[test]
    fn test_dominator_sets() {
        let f = simple_fn(vec![
            block(
                "entry",
                vec![instr(0, Op::ConstBool(true))],
                Terminator::Branch {
                    cond: 0,
                    then_label: "a".into(),
                    else_label: "b".into(),
                },
            ),
            block("a", vec![], Terminator::Jump("m".into())),
            block("b", vec![], Terminator::Jump("m".into())),
            block("m", vec![instr(1, Op::ConstNil)], Terminator::Return(1)),
        ]);
        let reach = reachable_blocks(&f);
        let preds = predecessors(&f);
        let doms = dominators(&f, &reach, &preds);
        assert!(doms["m"].contains("entry"));
        assert!(!doms["m"].contains("a"));
        assert!(doms["a"].contains("entry"));
    }
}
