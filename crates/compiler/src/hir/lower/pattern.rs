//! `case ... in` lowering
//!
//! Each clause becomes a chain of guards evaluated left to right: literal
//! equality, type tests, array shape with head/rest/tail recursion, hash
//! shape with shorthand binding, pins, captures, alternation, and user `if`
//! guards. A failed guard branches to the next clause; all clause bodies
//! join in a single merge block. Without an `else` arm, fallthrough raises
//! the dedicated no-matching-pattern error.

use super::*;
use crate::cst::Pattern;
use crate::tast::{TExpr, TInClause};
use crate::types::Type;

impl RootLower<'_> {
    pub(super) fn lower_case_in(
        &mut self,
        subject: &TExpr,
        clauses: &[TInClause],
        else_body: Option<&[TExpr]>,
        ty: &Type,
    ) -> Result<ValueId, String> {
        let subj = self.lower_expr(subject)?;
        let merge_l = self.fresh_label("casemerge");
        let mut incomings = Vec::new();

        let mut next_l = self.fresh_label("clause");
        self.seal(Terminator::Jump(next_l.clone()));

        for clause in clauses {
            self.start(next_l.clone());
            next_l = self.fresh_label("clause");

            self.lower_pattern(&clause.pattern, subj, &next_l)?;

            if let Some(guard) = &clause.guard {
                let g = self.lower_expr(guard)?;
                let body_l = self.fresh_label("guarded");
                self.seal(Terminator::Branch {
                    cond: g,
                    then_label: body_l.clone(),
                    else_label: next_l.clone(),
                });
                self.start(body_l);
            }

            let v = self.lower_body(&clause.body)?;
            if self.fr().unreachable {
                self.seal(Terminator::Jump("exit".to_string()));
            } else {
                let v = match v {
                    Some(v) => v,
                    None => self.push(Op::ConstNil, Type::Nil),
                };
                incomings.push((self.fr().cur_label.clone(), v));
                self.seal(Terminator::Jump(merge_l.clone()));
            }
        }

        // fallthrough: else arm, or the shape error
        self.start(next_l);
        match else_body {
            Some(body) => {
                let v = self.lower_body(body)?;
                if self.fr().unreachable {
                    self.seal(Terminator::Jump("exit".to_string()));
                } else {
                    let v = match v {
                        Some(v) => v,
                        None => self.push(Op::ConstNil, Type::Nil),
                    };
                    incomings.push((self.fr().cur_label.clone(), v));
                    self.seal(Terminator::Jump(merge_l.clone()));
                }
            }
            None => {
                self.seal(Terminator::Raise(RaiseKind::NoMatchingPattern { value: subj }));
            }
        }

        if incomings.is_empty() {
            self.start_unreachable(merge_l);
            return Ok(self.push(Op::ConstNil, Type::Nil));
        }
        self.start(merge_l);
        Ok(self.push(Op::Phi { incomings }, ty.clone()))
    }

    /// Emit the guard chain for one pattern against `value`. On success,
    /// control falls through with all bindings stored; on failure it
    /// branches to `fail_l`.
    fn lower_pattern(
        &mut self,
        pattern: &Pattern,
        value: ValueId,
        fail_l: &str,
    ) -> Result<(), String> {
        match pattern {
            Pattern::Lit { node } => {
                // re-type the literal through the CST path it came from
                let lit = self.lower_cst_literal(node)?;
                let eq = self.push(Op::ValueEq { lhs: lit, rhs: value }, Type::Bool);
                self.branch_on(eq, fail_l);
                Ok(())
            }
            Pattern::TypeTest { constant } => {
                let t = self.push(
                    Op::KindOf { value, class_name: constant.clone() },
                    Type::Bool,
                );
                self.branch_on(t, fail_l);
                Ok(())
            }
            Pattern::Pin { expr } => {
                let pinned = self.lower_cst_literal(expr)?;
                let eq = self.push(Op::ValueEq { lhs: pinned, rhs: value }, Type::Bool);
                self.branch_on(eq, fail_l);
                Ok(())
            }
            Pattern::Capture { pattern, name } => {
                if let Some(inner) = pattern {
                    self.lower_pattern(inner, value, fail_l)?;
                }
                let ty = match pattern.as_deref() {
                    Some(Pattern::TypeTest { constant }) => {
                        Type::from_constant_name(constant).unwrap_or(Type::Value)
                    }
                    _ => Type::Value,
                };
                let id = self.local(name, &ty);
                self.store_slot(id, value);
                Ok(())
            }
            Pattern::ArrayPat { pre, rest, post } => {
                let is_ary = self.push(
                    Op::KindOf { value, class_name: "Array".to_string() },
                    Type::Bool,
                );
                self.branch_on(is_ary, fail_l);

                let len = self.push(Op::ArrayLen(value), Type::Int);
                let min = (pre.len() + post.len()) as i64;
                let min_v = self.push(Op::ConstInt(min), Type::Int);
                let len_ok = self.push(
                    Op::CallMethod {
                        recv: Some(len),
                        method: if rest.is_some() { ">=" } else { "==" }.to_string(),
                        args: vec![min_v],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Bool,
                );
                self.branch_on(len_ok, fail_l);

                for (i, p) in pre.iter().enumerate() {
                    let el = self.push(
                        Op::ArrayGet { ary: value, index: i as i64 },
                        Type::Value,
                    );
                    self.lower_pattern(p, el, fail_l)?;
                }
                if let Some(splat) = rest {
                    if let Some(name) = &splat.name {
                        let slice = self.push(
                            Op::ArraySlice {
                                ary: value,
                                start: pre.len() as i64,
                                drop_back: post.len() as i64,
                            },
                            Type::Array,
                        );
                        let id = self.local(name, &Type::Array);
                        self.store_slot(id, slice);
                    }
                }
                for (i, p) in post.iter().enumerate() {
                    let idx = -((post.len() - i) as i64);
                    let el = self.push(Op::ArrayGet { ary: value, index: idx }, Type::Value);
                    self.lower_pattern(p, el, fail_l)?;
                }
                Ok(())
            }
            Pattern::HashPat { entries } => {
                let is_hash = self.push(
                    Op::KindOf { value, class_name: "Hash".to_string() },
                    Type::Bool,
                );
                self.branch_on(is_hash, fail_l);
                for entry in entries {
                    let has = self.push(
                        Op::HashHasKey { hash: value, key: entry.key.clone() },
                        Type::Bool,
                    );
                    self.branch_on(has, fail_l);
                    let v = self.push(
                        Op::HashGetSym { hash: value, key: entry.key.clone() },
                        Type::Value,
                    );
                    match &entry.value {
                        Some(p) => self.lower_pattern(p, v, fail_l)?,
                        None => {
                            // shorthand binding: `{name:}` binds `name`
                            let id = self.local(&entry.key, &Type::Value);
                            self.store_slot(id, v);
                        }
                    }
                }
                Ok(())
            }
            Pattern::Alt { alternatives } => {
                // leftmost success wins; each alternative gets its own
                // fail-over edge to the next
                let ok_l = self.fresh_label("altok");
                for (i, alt) in alternatives.iter().enumerate() {
                    let is_last = i + 1 == alternatives.len();
                    let next_alt = if is_last {
                        fail_l.to_string()
                    } else {
                        self.fresh_label("alt")
                    };
                    self.lower_pattern(alt, value, &next_alt)?;
                    self.seal(Terminator::Jump(ok_l.clone()));
                    if !is_last {
                        self.start(next_alt);
                    }
                }
                self.start(ok_l);
                Ok(())
            }
        }
    }

    /// Branch: continue on true, fail the clause on false.
    fn branch_on(&mut self, cond: ValueId, fail_l: &str) {
        let ok_l = self.fresh_label("pat");
        self.seal(Terminator::Branch {
            cond,
            then_label: ok_l.clone(),
            else_label: fail_l.to_string(),
        });
        self.start(ok_l);
    }

    /// Pattern literals and pinned expressions arrive as raw CST nodes
    /// (they were not walked by the typed-AST builder); only the literal
    /// and variable forms are meaningful here.
    fn lower_cst_literal(&mut self, node: &crate::cst::Node) -> Result<ValueId, String> {
        use crate::cst::Node;
        match node {
            Node::Int { value } => Ok(self.push(Op::ConstInt(*value), Type::Int)),
            Node::Float { value } => Ok(self.push(Op::ConstFloat(*value), Type::Float)),
            Node::Str { value } => Ok(self.push(Op::ConstStr(value.clone()), Type::Str)),
            Node::Sym { name } => Ok(self.push(Op::ConstSym(name.clone()), Type::Symbol)),
            Node::True => Ok(self.push(Op::ConstBool(true), Type::Bool)),
            Node::False => Ok(self.push(Op::ConstBool(false), Type::Bool)),
            Node::Nil => Ok(self.push(Op::ConstNil, Type::Nil)),
            Node::Lvar { name } => {
                let id = self.local(name, &Type::Value);
                Ok(self.load_slot(id, &Type::Value))
            }
            Node::Const { name } => Ok(self.push(Op::LoadConst(name.clone()), Type::Value)),
            other => Err(format!(
                "Unsupported construct: pattern expression {:?}",
                std::mem::discriminant(other)
            )),
        }
    }
}
