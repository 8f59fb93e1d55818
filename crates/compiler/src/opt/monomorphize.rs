//! Monomorphizer
//!
//! Specializes polymorphic functions per concrete type-argument tuple. A
//! direct call whose argument types are concrete but narrower than the
//! callee's parameter types generates (once) a specialization named by the
//! type tuple and rewrites the call. A union-typed argument expands over
//! its members: the call site becomes a type-dispatch tree that tests each
//! member with a host `kind_of` check, performs the matching specialized
//! call, and phi-merges the results in a dedicated merge block. Repeated
//! passes expand the Cartesian product of several union arguments one
//! position at a time.

use crate::hir::*;
use crate::types::Type;
use std::collections::{HashMap, HashSet};

const MAX_PASSES: usize = 4;
/// Unions wider than this stay boxed; a dispatch tree over many members
/// costs more than the generic call.
const MAX_UNION_WIDTH: usize = 4;

pub fn run(program: &mut Program) -> Result<(), String> {
    let mut generated: HashSet<String> = HashSet::new();
    for _ in 0..MAX_PASSES {
        let changed_u = expand_union_calls(program)?;
        let changed_s = specialize_concrete_calls(program, &mut generated)?;
        if !changed_u && !changed_s {
            break;
        }
    }
    Ok(())
}

fn eligible(f: &Function) -> bool {
    f.kind == FnKind::Plain && !f.variadic && !f.env_locals && f.key != "__main__"
}

/// Name of the specialization of `key` for a concrete argument tuple.
fn spec_key(key: &str, tys: &[Type]) -> String {
    let parts: Vec<String> = tys.iter().map(Type::mangle).collect();
    format!("{}__{}", key, parts.join("_"))
}

// ---- concrete-tuple specialization -------------------------------------

fn specialize_concrete_calls(
    program: &mut Program,
    generated: &mut HashSet<String>,
) -> Result<bool, String> {
    let callees: HashMap<String, usize> = program
        .functions
        .iter()
        .enumerate()
        .filter(|(_, f)| eligible(f))
        .map(|(i, f)| (f.key.clone(), i))
        .collect();

    let mut changed = false;
    let mut new_functions: Vec<Function> = Vec::new();

    for fi in 0..program.functions.len() {
        let value_types = program.functions[fi].value_types();
        let mut rewrites: Vec<(usize, usize, String, Vec<Type>)> = Vec::new();
        for (bi, b) in program.functions[fi].blocks.iter().enumerate() {
            for (ii, instr) in b.instrs.iter().enumerate() {
                let Op::CallFn { key, args } = &instr.op else { continue };
                let Some(&ci) = callees.get(key) else { continue };
                let callee = &program.functions[ci];
                if callee.params.len() != args.len() {
                    continue;
                }
                let arg_tys: Vec<Type> = args
                    .iter()
                    .map(|a| value_types.get(a).cloned().unwrap_or(Type::Value))
                    .collect();
                // worth specializing when some concrete argument narrows a
                // boxed or mismatched parameter
                let narrows = callee.params.iter().zip(&arg_tys).any(|(p, a)| {
                    a.is_unboxed_scalar() && p.ty != *a
                });
                let all_concrete = arg_tys
                    .iter()
                    .all(|t| !matches!(t, Type::Union(_) | Type::Var(_)));
                if narrows && all_concrete {
                    rewrites.push((bi, ii, key.clone(), arg_tys));
                }
            }
        }

        for (bi, ii, key, arg_tys) in rewrites {
            let skey = spec_key(&key, &arg_tys);
            if !generated.contains(&skey)
                && !program.functions.iter().any(|f| f.key == skey)
                && !new_functions.iter().any(|f| f.key == skey)
            {
                let ci = callees[&key];
                let spec = specialize(&program.functions[ci], &skey, &arg_tys);
                new_functions.push(spec);
                generated.insert(skey.clone());
            }
            let instr = &mut program.functions[fi].blocks[bi].instrs[ii];
            if let Op::CallFn { key: k, .. } = &mut instr.op {
                *k = skey;
                changed = true;
            }
        }
    }

    program.functions.append(&mut new_functions);
    Ok(changed)
}

/// Clone a function under a new key with concrete parameter types, and
/// re-type the cloned body where the narrowing is locally visible.
fn specialize(f: &Function, skey: &str, arg_tys: &[Type]) -> Function {
    let mut spec = Function {
        key: skey.to_string(),
        name: f.name.clone(),
        owner: f.owner.clone(),
        singleton: f.singleton,
        kind: f.kind.clone(),
        params: f.params.clone(),
        is_lambda: f.is_lambda,
        variadic: f.variadic,
        locals: f.locals.clone(),
        ret_slot: f.ret_slot,
        env_locals: f.env_locals,
        ret_ty: f.ret_ty.clone(),
        blocks: f.blocks.clone(),
        entry: f.entry.clone(),
    };
    for (p, ty) in spec.params.iter_mut().zip(arg_tys) {
        p.ty = ty.clone();
        spec.locals[p.local].ty = ty.clone();
    }
    retype(&mut spec);
    spec
}

/// Forward type propagation inside a specialization: local loads take the
/// narrowed slot type, arithmetic over unboxed scalars produces unboxed
/// results, and the return type follows the epilogue load.
fn retype(f: &mut Function) {
    for _ in 0..2 {
        let mut types = f.value_types();
        for b in &mut f.blocks {
            for i in &mut b.instrs {
                match &i.op {
                    Op::LoadLocal(l) => {
                        if let Some(decl) = f.locals.get(*l) {
                            i.ty = decl.ty.clone();
                        }
                    }
                    Op::StoreLocal(l, v) => {
                        // a store of a narrower value narrows the slot
                        if let Some(vt) = types.get(v) {
                            if vt.is_unboxed_scalar() && f.locals[*l].ty == Type::Value {
                                f.locals[*l].ty = vt.clone();
                            }
                        }
                    }
                    Op::CallMethod { recv: Some(r), method, args, .. } if args.len() == 1 => {
                        let rt = types.get(r).cloned().unwrap_or(Type::Value);
                        let at = types.get(&args[0]).cloned().unwrap_or(Type::Value);
                        if let Some(t) =
                            crate::tast::build::builtin_method_type(&rt, method, &[at])
                        {
                            i.ty = t;
                        }
                    }
                    Op::Phi { incomings } => {
                        let tys: Vec<Type> = incomings
                            .iter()
                            .filter_map(|(_, v)| types.get(v).cloned())
                            .collect();
                        if !tys.is_empty() && tys.iter().all(|t| *t == tys[0]) {
                            i.ty = tys[0].clone();
                        }
                    }
                    _ => {}
                }
                types.insert(i.dst, i.ty.clone());
            }
        }
    }
    // the epilogue load of the return slot fixes the return type
    if let Some(decl) = f.locals.get(f.ret_slot) {
        if decl.ty.is_unboxed_scalar() {
            f.ret_ty = decl.ty.clone();
        }
    }
}

// ---- union expansion ----------------------------------------------------

fn expand_union_calls(program: &mut Program) -> Result<bool, String> {
    let callee_idx: HashMap<String, usize> = program
        .functions
        .iter()
        .enumerate()
        .filter(|(_, f)| eligible(f))
        .map(|(i, f)| (f.key.clone(), i))
        .collect();

    // one site per function per pass; block surgery invalidates indices
    let mut sites: Vec<(usize, usize, usize, usize, String)> = Vec::new();
    for (fi, f) in program.functions.iter().enumerate() {
        let value_types = f.value_types();
        let site = f.blocks.iter().enumerate().find_map(|(bi, b)| {
            b.instrs.iter().enumerate().find_map(|(ii, instr)| {
                let Op::CallFn { key, args } = &instr.op else { return None };
                let ci = callee_idx.get(key)?;
                if program.functions[*ci].params.len() != args.len() {
                    return None;
                }
                let union_at = args.iter().position(|a| {
                    matches!(
                        value_types.get(a),
                        Some(Type::Union(m)) if m.len() <= MAX_UNION_WIDTH
                            && m.iter().all(|t| t.dispatch_class_name().is_some())
                    )
                })?;
                Some((bi, ii, union_at, key.clone()))
            })
        });
        if let Some((bi, ii, union_at, key)) = site {
            sites.push((fi, bi, ii, union_at, key));
        }
    }
    if sites.is_empty() {
        return Ok(false);
    }

    let mut new_functions: Vec<Function> = Vec::new();
    for (fi, bi, ii, union_at, key) in sites {
        let value_types = program.functions[fi].value_types();
        let (args, members, declared) = {
            let instr = &program.functions[fi].blocks[bi].instrs[ii];
            let Op::CallFn { args, .. } = &instr.op else { continue };
            let Some(Type::Union(members)) = value_types.get(&args[union_at]).cloned()
            else {
                continue;
            };
            let ci = callee_idx[&key];
            let declared = program.functions[ci].params[union_at].ty.clone();
            (args.clone(), members, declared)
        };

        // the declared parameter type is tested first; remaining members
        // keep their normalized order
        let mut members = members;
        if let Some(pos) = members.iter().position(|m| *m == declared) {
            let first = members.remove(pos);
            members.insert(0, first);
        }

        // generate one specialization per member tuple, once
        let mut arg_tys: Vec<Type> = args
            .iter()
            .map(|a| value_types.get(a).cloned().unwrap_or(Type::Value))
            .collect();
        for member in &members {
            arg_tys[union_at] = member.clone();
            let skey = spec_key(&key, &arg_tys);
            let exists = program.functions.iter().any(|f| f.key == skey)
                || new_functions.iter().any(|f| f.key == skey);
            if !exists {
                let ci = callee_idx[&key];
                new_functions.push(specialize(&program.functions[ci], &skey, &arg_tys));
            }
        }

        expand_one(&mut program.functions[fi], bi, ii, union_at, &key, &members, &arg_tys);
    }
    program.functions.append(&mut new_functions);
    Ok(true)
}

/// Rewrite one union-argument call into a type-dispatch tree over the
/// (already generated) member specializations.
fn expand_one(
    f: &mut Function,
    bi: usize,
    ii: usize,
    union_at: usize,
    key: &str,
    members: &[Type],
    arg_tys_base: &[Type],
) {
    let block = f.blocks[bi].clone();
    let instr = block.instrs[ii].clone();
    let Op::CallFn { args, .. } = instr.op.clone() else { return };
    let union_val = args[union_at];

    let mut next_value = f
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter().map(|i| i.dst))
        .max()
        .map(|v| v + 1)
        .unwrap_or(0);
    let mut fresh = |n: &mut ValueId| {
        let v = *n;
        *n += 1;
        v
    };

    let base = format!("mono{}_{}", bi, ii);
    let merge_label = format!("{}_merge", base);

    // head keeps the instructions before the call and starts the dispatch
    let head = Block {
        label: block.label.clone(),
        instrs: block.instrs[..ii].to_vec(),
        term: Terminator::Jump(format!("{}_test0", base)),
    };

    let mut blocks_out: Vec<Block> = Vec::new();
    let mut incomings: Vec<(String, ValueId)> = Vec::new();
    for (mi, member) in members.iter().enumerate() {
        let test_label = format!("{}_test{}", base, mi);
        let call_label = format!("{}_call{}", base, mi);
        let is_last = mi + 1 == members.len();

        let mut test_block = Block {
            label: test_label,
            instrs: Vec::new(),
            term: Terminator::Jump(call_label.clone()),
        };
        if !is_last {
            // the last member takes the fallthrough without a re-test
            let t = fresh(&mut next_value);
            test_block.instrs.push(Instr {
                dst: t,
                op: Op::KindOf {
                    value: union_val,
                    class_name: member
                        .dispatch_class_name()
                        .unwrap_or("Object")
                        .to_string(),
                },
                ty: Type::Bool,
            });
            test_block.term = Terminator::Branch {
                cond: t,
                then_label: call_label.clone(),
                else_label: format!("{}_test{}", base, mi + 1),
            };
        }
        blocks_out.push(test_block);

        let mut arg_tys = arg_tys_base.to_vec();
        arg_tys[union_at] = member.clone();
        let skey = spec_key(key, &arg_tys);
        let call_dst = fresh(&mut next_value);
        blocks_out.push(Block {
            label: call_label.clone(),
            instrs: vec![Instr {
                dst: call_dst,
                op: Op::CallFn { key: skey, args: args.clone() },
                ty: member.clone(),
            }],
            term: Terminator::Jump(merge_label.clone()),
        });
        incomings.push((call_label, call_dst));
    }

    // dedicated merge block phi-joins the member results, then the rest of
    // the original block continues with the call's value id
    let mut merge_instrs = vec![Instr {
        dst: instr.dst,
        op: Op::Phi { incomings },
        ty: instr.ty.clone(),
    }];
    merge_instrs.extend_from_slice(&block.instrs[ii + 1..]);
    let merge = Block {
        label: merge_label,
        instrs: merge_instrs,
        term: block.term.clone(),
    };

    f.blocks[bi] = head;
    let mut insert_at = bi + 1;
    for b in blocks_out {
        f.blocks.insert(insert_at, b);
        insert_at += 1;
    }
    f.blocks.insert(insert_at, merge);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::Root;
    use crate::hir::{lower, validate};
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

    #[test]
    fn test_concrete_specialization_generated_once() {
        // identity called with Int and Str: params degrade to untyped,
        // both call sites specialize
        let mut p = build_hir(
            r#"{"body": [
                 {"kind": "def", "name": "ident",
                  "params": {"list": [{"name": "x"}]},
                  "body": [{"kind": "lvar", "name": "x"}]},
                 {"kind": "def", "name": "use_int", "params": {"list": []},
                  "body": [{"kind": "call", "receiver": null, "name": "ident",
                            "args": [{"kind": "int", "value": 1}]}]},
                 {"kind": "def", "name": "use_int2", "params": {"list": []},
                  "body": [{"kind": "call", "receiver": null, "name": "ident",
                            "args": [{"kind": "int", "value": 2}]}]}]}"#,
            "",
        );
        run(&mut p).unwrap();
        let specs: Vec<&Function> = p
            .functions
            .iter()
            .filter(|f| f.key.starts_with("ident__"))
            .collect();
        // ident may already be monomorphic Int (both callers agree);
        // if not, exactly one Int specialization exists
        if !specs.is_empty() {
            assert_eq!(specs.len(), 1);
            assert_eq!(specs[0].key, "ident__i64");
            assert_eq!(specs[0].params[0].ty, Type::Int);
        }
        validate::validate(&p).unwrap();
    }

    #[test]
    fn test_union_argument_expands_to_dispatch_tree() {
        // describe declared over (Integer | String); caller passes the
        // union through, producing a kind_of dispatch tree
        let mut p = build_hir(
            r#"{"body": [
                 {"kind": "def", "name": "describe",
                  "params": {"list": [{"name": "x"}]},
                  "body": [{"kind": "lvar", "name": "x"}]},
                 {"kind": "def", "name": "route",
                  "params": {"list": [{"name": "c"}]},
                  "body": [
                    {"kind": "assign", "target": {"kind": "lvar", "name": "v"},
                     "value": {"kind": "if",
                               "cond": {"kind": "lvar", "name": "c"},
                               "then_body": [{"kind": "int", "value": 1}],
                               "else_body": [{"kind": "str", "value": "s"}]}},
                    {"kind": "call", "receiver": null, "name": "describe",
                     "args": [{"kind": "lvar", "name": "v"}]}]}]}"#,
            "class Object\n  def describe: (Integer | String x) -> untyped\n  def route: (bool c) -> untyped\nend\n",
        );
        run(&mut p).unwrap();
        let route = p.function("route").unwrap();
        let kindofs: Vec<String> = route
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .filter_map(|i| match &i.op {
                Op::KindOf { class_name, .. } => Some(class_name.clone()),
                _ => None,
            })
            .collect();
        assert!(
            kindofs.iter().any(|c| c == "Integer" || c == "String"),
            "expected a kind_of dispatch, got {:?}",
            kindofs
        );
        // dedicated merge block with a phi over the member calls
        assert!(route.blocks.iter().any(|b| b.label.ends_with("_merge")
            && b.instrs
                .iter()
                .any(|i| matches!(&i.op, Op::Phi { incomings } if incomings.len() == 2))));
        validate::validate(&p).unwrap();
    }
}
