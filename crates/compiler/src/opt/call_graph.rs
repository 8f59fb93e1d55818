//! Call graph over direct calls, for recursion detection
//!
//! The inliner refuses candidates that sit in a recursive cycle, direct or
//! mutual. Cycles are strongly connected components of the direct-call
//! graph, found with Tarjan's algorithm.

use crate::hir::{Op, Program};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct CallGraph {
    /// function key -> keys it calls directly
    edges: HashMap<String, HashSet<String>>,
    keys: HashSet<String>,
    recursive_sccs: Vec<HashSet<String>>,
}

impl CallGraph {
    pub fn build(program: &Program) -> Self {
        let keys: HashSet<String> = program.functions.iter().map(|f| f.key.clone()).collect();
        let mut edges: HashMap<String, HashSet<String>> = HashMap::new();
        for f in &program.functions {
            let mut callees = HashSet::new();
            for b in &f.blocks {
                for i in &b.instrs {
                    if let Op::CallFn { key, .. } = &i.op {
                        if keys.contains(key) {
                            callees.insert(key.clone());
                        }
                    }
                }
            }
            edges.insert(f.key.clone(), callees);
        }
        let mut graph = CallGraph {
            edges,
            keys,
            recursive_sccs: Vec::new(),
        };
        graph.recursive_sccs = graph.find_sccs();
        graph
    }

    /// Is the function part of any recursive cycle (direct or mutual)?
    pub fn is_recursive(&self, key: &str) -> bool {
        self.recursive_sccs.iter().any(|scc| scc.contains(key))
    }

    pub fn callees(&self, key: &str) -> Option<&HashSet<String>> {
        self.edges.get(key)
    }

    /// Strongly connected components via Tarjan's algorithm, filtered to
    /// those that represent recursion.
    fn find_sccs(&self) -> Vec<HashSet<String>> {
        let mut index_counter = 0usize;
        let mut stack: Vec<String> = Vec::new();
        let mut on_stack: HashSet<String> = HashSet::new();
        let mut indices: HashMap<String, usize> = HashMap::new();
        let mut lowlinks: HashMap<String, usize> = HashMap::new();
        let mut sccs: Vec<HashSet<String>> = Vec::new();

        for key in &self.keys {
            if !indices.contains_key(key) {
                self.visit(
                    key,
                    &mut index_counter,
                    &mut stack,
                    &mut on_stack,
                    &mut indices,
                    &mut lowlinks,
                    &mut sccs,
                );
            }
        }

        sccs.into_iter()
            .filter(|scc| {
                if scc.len() > 1 {
                    true
                } else {
                    let key = scc.iter().next().unwrap();
                    self.edges
                        .get(key)
                        .map(|c| c.contains(key))
                        .unwrap_or(false)
                }
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        key: &str,
        index_counter: &mut usize,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
        indices: &mut HashMap<String, usize>,
        lowlinks: &mut HashMap<String, usize>,
        sccs: &mut Vec<HashSet<String>>,
    ) {
        let index = *index_counter;
        *index_counter += 1;
        indices.insert(key.to_string(), index);
        lowlinks.insert(key.to_string(), index);
        stack.push(key.to_string());
        on_stack.insert(key.to_string());

        if let Some(callees) = self.edges.get(key) {
            for callee in callees.clone() {
                if !indices.contains_key(&callee) {
                    self.visit(
                        &callee,
                        index_counter,
                        stack,
                        on_stack,
                        indices,
                        lowlinks,
                        sccs,
                    );
                    let low = lowlinks[&callee].min(lowlinks[key]);
                    lowlinks.insert(key.to_string(), low);
                } else if on_stack.contains(&callee) {
                    let low = indices[&callee].min(lowlinks[key]);
                    lowlinks.insert(key.to_string(), low);
                }
            }
        }

        if lowlinks[key] == indices[key] {
            let mut scc = HashSet::new();
            while let Some(top) = stack.pop() {
                on_stack.remove(&top);
                let done = top == key;
                scc.insert(top);
                if done {
                    break;
                }
            }
            sccs.push(scc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::*;
    use crate::types::Type;

    fn call_fn(dst: ValueId, key: &str) -> Instr {
        Instr {
            dst,
            op: Op::CallFn { key: key.to_string(), args: vec![] },
            ty: Type::Value,
        }
    }

    fn fn_with_calls(key: &str, calls: &[&str]) -> Function {
        let instrs: Vec<Instr> = calls
            .iter()
            .enumerate()
            .map(|(i, c)| call_fn(i as ValueId, c))
            .collect();
        let ret = instrs.len() as ValueId;
        let mut all = instrs;
        all.push(Instr { dst: ret, op: Op::ConstNil, ty: Type::Nil });
        Function {
            key: key.to_string(),
            name: key.to_string(),
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
            blocks: vec![Block {
                label: "entry".into(),
                instrs: all,
                term: Terminator::Return(ret),
            }],
            entry: "entry".into(),
        }
    }

    #[test]
    fn test_direct_recursion_detected() {
        let p = Program {
            functions: vec![fn_with_calls("f", &["f"]), fn_with_calls("g", &["f"])],
            ..Program::default()
        };
        let cg = CallGraph::build(&p);
        assert!(cg.is_recursive("f"));
        assert!(!cg.is_recursive("g"));
    }

    #[test]
    fn test_mutual_recursion_detected() {
        let p = Program {
            functions: vec![
                fn_with_calls("even", &["odd"]),
                fn_with_calls("odd", &["even"]),
                fn_with_calls("leaf", &[]),
            ],
            ..Program::default()
        };
        let cg = CallGraph::build(&p);
        assert!(cg.is_recursive("even"));
        assert!(cg.is_recursive("odd"));
        assert!(!cg.is_recursive("leaf"));
    }

    #[test]
    fn test_acyclic_chain() {
        let p = Program {
            functions: vec![
                fn_with_calls("a", &["b"]),
                fn_with_calls("b", &["c"]),
                fn_with_calls("c", &[]),
            ],
            ..Program::default()
        };
        let cg = CallGraph::build(&p);
        assert!(!cg.is_recursive("a"));
        assert!(cg.callees("a").unwrap().contains("b"));
    }
}
