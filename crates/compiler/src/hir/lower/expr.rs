//! Expression lowering: literals, variables, assignments, calls, control
//! flow, closures, and the parameter prologue.

use super::*;
use crate::cst::ParamLabel;
use crate::tast::{Dispatch, ReceiverKind, TExpr, TExprKind, TFunction, TMlhs, TTarget};
use crate::types::Type;

impl RootLower<'_> {
    // ---- parameter prologue --------------------------------------------

    /// Allocate parameter slots and emit the prologue: optional-positional
    /// defaults, keyword lookups with the missing-keyword check, and the
    /// synthetic kwargs-hash parameter when keywords are present.
    pub fn lower_params(&mut self, tf: &TFunction) -> Result<(), String> {
        let mut kw_params = Vec::new();
        let mut has_kwrest = false;

        for p in &tf.params {
            let kind = match p.label {
                ParamLabel::Required => ParamKind::Required,
                ParamLabel::Optional => ParamKind::Optional,
                ParamLabel::Rest => ParamKind::Rest,
                ParamLabel::Keyword => ParamKind::Keyword,
                ParamLabel::KeywordOptional => ParamKind::KeywordOptional,
                ParamLabel::KeywordRest => {
                    has_kwrest = true;
                    ParamKind::KeywordRest
                }
                ParamLabel::Block => ParamKind::Block,
            };
            let slot = self.local(&p.name, &p.ty);
            self.fr().params.push(FnParam {
                name: p.name.clone(),
                kind,
                ty: p.ty.clone(),
                local: slot,
            });
            if matches!(kind, ParamKind::Keyword | ParamKind::KeywordOptional) {
                kw_params.push(p.clone());
            }
        }

        // keyword parameters read from a kwargs hash; reuse a declared
        // `**rest` parameter as the hash, otherwise synthesize one
        let kw_hash_slot = if !kw_params.is_empty() {
            if has_kwrest {
                let name = tf
                    .params
                    .iter()
                    .find(|p| p.label == ParamLabel::KeywordRest)
                    .map(|p| p.name.clone())
                    .unwrap();
                Some(self.local(&name, &Type::Hash))
            } else {
                let slot = self.local("__kwargs", &Type::Hash);
                self.fr().params.push(FnParam {
                    name: "__kwargs".to_string(),
                    kind: ParamKind::KeywordRest,
                    ty: Type::Hash,
                    local: slot,
                });
                Some(slot)
            }
        } else {
            None
        };

        // optional positional defaults: the wrapper passes the undef
        // sentinel for absent arguments
        for p in &tf.params {
            if p.label != ParamLabel::Optional {
                continue;
            }
            let slot = self.local(&p.name, &p.ty);
            let cur = self.load_slot(slot, &p.ty);
            let is_undef = self.push(Op::IsUndef(cur), Type::Bool);
            let dflt_l = self.fresh_label("dflt");
            let cont_l = self.fresh_label("cont");
            self.seal(Terminator::Branch {
                cond: is_undef,
                then_label: dflt_l.clone(),
                else_label: cont_l.clone(),
            });
            self.start(dflt_l);
            let d = match &p.default {
                Some(d) => self.lower_expr(d)?,
                None => self.push(Op::ConstNil, Type::Nil),
            };
            self.store_slot(slot, d);
            self.seal(Terminator::Jump(cont_l.clone()));
            self.start(cont_l);
        }

        // keyword parameters: look up by interned name against the undef
        // sentinel; required keywords raise, optional ones take defaults
        for p in &kw_params {
            let hash_slot = kw_hash_slot.unwrap();
            let slot = self.local(&p.name, &p.ty);
            let h = self.load_slot(hash_slot, &Type::Hash);
            let v = self.push(
                Op::KwLookup { hash: h, name: p.name.clone() },
                p.ty.clone(),
            );
            let is_undef = self.push(Op::IsUndef(v), Type::Bool);
            let miss_l = self.fresh_label("kwmiss");
            let have_l = self.fresh_label("kwhave");
            let done_l = self.fresh_label("kwdone");
            self.seal(Terminator::Branch {
                cond: is_undef,
                then_label: miss_l.clone(),
                else_label: have_l.clone(),
            });
            self.start(miss_l);
            if p.label == ParamLabel::Keyword {
                self.seal(Terminator::Raise(RaiseKind::ArgumentError {
                    message: format!("missing keyword: :{}", p.name),
                }));
            } else {
                let d = match &p.default {
                    Some(d) => self.lower_expr(d)?,
                    None => self.push(Op::ConstNil, Type::Nil),
                };
                self.store_slot(slot, d);
                self.seal(Terminator::Jump(done_l.clone()));
            }
            self.start(have_l);
            self.store_slot(slot, v);
            self.seal(Terminator::Jump(done_l.clone()));
            self.start(done_l);
        }
        Ok(())
    }

    // ---- expressions ----------------------------------------------------

    pub fn lower_expr(&mut self, e: &TExpr) -> Result<ValueId, String> {
        match &e.kind {
            TExprKind::IntLit(v) => Ok(self.push(Op::ConstInt(*v), Type::Int)),
            TExprKind::FloatLit(v) => Ok(self.push(Op::ConstFloat(*v), Type::Float)),
            TExprKind::StrLit(v) => Ok(self.push(Op::ConstStr(v.clone()), Type::Str)),
            TExprKind::SymLit(v) => Ok(self.push(Op::ConstSym(v.clone()), Type::Symbol)),
            TExprKind::BoolLit(v) => Ok(self.push(Op::ConstBool(*v), Type::Bool)),
            TExprKind::NilLit => Ok(self.push(Op::ConstNil, Type::Nil)),
            TExprKind::SelfRef => Ok(self.push(Op::SelfVal, e.ty.clone())),

            TExprKind::ArrayLit(items) => {
                let vals = items
                    .iter()
                    .map(|i| self.lower_expr(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.push(Op::ArrayNew(vals), Type::Array))
            }
            TExprKind::HashLit(pairs) => {
                let mut vals = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    vals.push((self.lower_expr(k)?, self.lower_expr(v)?));
                }
                Ok(self.push(Op::HashNew(vals), Type::Hash))
            }
            TExprKind::RangeLit { low, high, exclusive } => {
                let l = match low {
                    Some(l) => self.lower_expr(l)?,
                    None => self.push(Op::ConstNil, Type::Nil),
                };
                let h = match high {
                    Some(h) => self.lower_expr(h)?,
                    None => self.push(Op::ConstNil, Type::Nil),
                };
                Ok(self.push(
                    Op::RangeNew { low: l, high: h, exclusive: *exclusive },
                    Type::Range,
                ))
            }
            TExprKind::RegexpLit(src) => {
                Ok(self.push(Op::RegexpNew(src.clone()), Type::Regexp))
            }

            TExprKind::LocalGet(name) => {
                let id = self.local(name, &e.ty);
                let ty = e.ty.clone();
                Ok(self.load_slot(id, &ty))
            }
            TExprKind::IvarGet(name) => Ok(self.push(Op::LoadIvar(name.clone()), e.ty.clone())),
            TExprKind::GvarGet(name) => Ok(self.push(Op::LoadGvar(name.clone()), e.ty.clone())),
            TExprKind::CvarGet(name) => Ok(self.push(Op::LoadCvar(name.clone()), e.ty.clone())),
            TExprKind::ConstGet(name) => Ok(self.push(Op::LoadConst(name.clone()), e.ty.clone())),

            TExprKind::Assign { target, value } => {
                let v = self.lower_expr(value)?;
                self.lower_store(target, v, &value.ty)?;
                Ok(v)
            }
            TExprKind::OpAssign { target, op, value } => self.lower_op_assign(target, op, value, &e.ty),
            TExprKind::OrAssign { target, value } => self.lower_cond_assign(target, value, &e.ty, true),
            TExprKind::AndAssign { target, value } => {
                self.lower_cond_assign(target, value, &e.ty, false)
            }
            TExprKind::MultiAssign { targets, value } => self.lower_multi_assign(targets, value),
            TExprKind::ConstAssign { name, value } => {
                let v = self.lower_expr(value)?;
                self.push(Op::StoreConst(name.clone(), v), Type::Unit);
                Ok(v)
            }

            TExprKind::Call { receiver, recv_kind, method, args, kwargs, block, dispatch } => self
                .lower_call(
                    e,
                    receiver.as_deref(),
                    *recv_kind,
                    method,
                    args,
                    kwargs,
                    block.as_ref(),
                    dispatch,
                ),
            TExprKind::SuperCall { args, .. } => {
                let vals = args
                    .iter()
                    .map(|a| self.lower_expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.push(Op::SuperCall { args: vals }, e.ty.clone()))
            }
            TExprKind::YieldExpr { args } => {
                let vals = args
                    .iter()
                    .map(|a| self.lower_expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.push(Op::YieldBlock { args: vals }, e.ty.clone()))
            }
            TExprKind::LambdaLit { block } => {
                let params = block_params_of(block);
                let key = self.outline(
                    FnKind::BlockBody { parent: self.root_key.clone() },
                    &params,
                    &block.body,
                    block.is_lambda,
                    Type::Value,
                )?;
                Ok(self.push(
                    Op::ProcNew { body_fn: key, is_lambda: block.is_lambda },
                    e.ty.clone(),
                ))
            }

            TExprKind::And { lhs, rhs } => self.lower_and_or(lhs, rhs, &e.ty, true),
            TExprKind::Or { lhs, rhs } => self.lower_and_or(lhs, rhs, &e.ty, false),
            TExprKind::Not(v) => {
                let val = self.lower_expr(v)?;
                Ok(self.push(
                    Op::CallMethod {
                        recv: Some(val),
                        method: "!".to_string(),
                        args: vec![],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Bool,
                ))
            }

            TExprKind::If { cond, then_body, else_body } => {
                self.lower_if(cond, then_body, else_body, &e.ty)
            }
            TExprKind::While { cond, body, negated } => self.lower_while(cond, body, *negated),
            TExprKind::CaseIn { subject, clauses, else_body } => {
                self.lower_case_in(subject, clauses, else_body.as_deref(), &e.ty)
            }
            TExprKind::Begin { body, rescues, else_body, ensure_body } => {
                self.lower_begin(body, rescues, else_body, ensure_body, &e.ty)
            }

            TExprKind::Return(v) => {
                let val = match v {
                    Some(v) => self.lower_expr(v)?,
                    None => self.push(Op::ConstNil, Type::Nil),
                };
                self.lower_return(val);
                let dead = self.fresh_label("dead");
                self.start_unreachable(dead);
                Ok(self.push(Op::ConstNil, Type::Nil))
            }
            TExprKind::Break(_) => {
                let (_, exit) = self
                    .fr()
                    .loop_stack
                    .last()
                    .cloned()
                    .ok_or_else(|| "Unsupported construct: break outside of a loop".to_string())?;
                self.seal(Terminator::Jump(exit));
                let dead = self.fresh_label("dead");
                self.start_unreachable(dead);
                Ok(self.push(Op::ConstNil, Type::Nil))
            }
            TExprKind::Next(v) => {
                if let Some((cont, _)) = self.fr().loop_stack.last().cloned() {
                    self.seal(Terminator::Jump(cont));
                } else if matches!(self.fr().kind, FnKind::BlockBody { .. }) {
                    // `next v` ends the current block invocation with v
                    let val = match v {
                        Some(v) => self.lower_expr(v)?,
                        None => self.push(Op::ConstNil, Type::Nil),
                    };
                    let slot = self.fr().ret_slot;
                    self.store_slot(slot, val);
                    self.seal(Terminator::Jump("exit".to_string()));
                } else {
                    return Err("Unsupported construct: next outside of a loop".to_string());
                }
                let dead = self.fresh_label("dead");
                self.start_unreachable(dead);
                Ok(self.push(Op::ConstNil, Type::Nil))
            }
            TExprKind::Raise { args } => self.lower_raise(args),
        }
    }

    /// `return` stores to the result slot and jumps to the unique epilogue;
    /// inside outlined bodies it additionally sets the shared return flags
    /// so the enclosing function unwinds after the callback finishes.
    fn lower_return(&mut self, val: ValueId) {
        match self.fr().kind.clone() {
            FnKind::Plain | FnKind::FiberBody { .. } => {}
            _ => {
                let flag = self.push(Op::ConstBool(true), Type::Bool);
                self.push(Op::StoreEnv(ENV_RET_FLAG, flag), Type::Unit);
                self.push(Op::StoreEnv(ENV_RET_VAL, val), Type::Unit);
            }
        }
        let slot = self.fr().ret_slot;
        self.store_slot(slot, val);
        self.seal(Terminator::Jump("exit".to_string()));
    }

    /// After a call that ran an outlined body which may have executed a
    /// `return`, check the shared flag and unwind.
    pub(super) fn emit_ret_flag_check(&mut self) {
        if !self.env {
            return;
        }
        let flag = self.push(Op::LoadEnv(ENV_RET_FLAG), Type::Bool);
        let ret_l = self.fresh_label("retflag");
        let cont_l = self.fresh_label("cont");
        self.seal(Terminator::Branch {
            cond: flag,
            then_label: ret_l.clone(),
            else_label: cont_l.clone(),
        });
        self.start(ret_l);
        let rv = self.push(Op::LoadEnv(ENV_RET_VAL), Type::Value);
        let slot = self.fr().ret_slot;
        self.store_slot(slot, rv);
        self.seal(Terminator::Jump("exit".to_string()));
        self.start(cont_l);
    }

    // ---- stores ---------------------------------------------------------

    pub(super) fn lower_store(
        &mut self,
        target: &TTarget,
        v: ValueId,
        ty: &Type,
    ) -> Result<(), String> {
        match target {
            TTarget::Local(name) => {
                let id = self.local(name, ty);
                self.store_slot(id, v);
            }
            TTarget::Ivar(name) => {
                self.push(Op::StoreIvar(name.clone(), v), Type::Unit);
            }
            TTarget::Gvar(name) => {
                self.push(Op::StoreGvar(name.clone(), v), Type::Unit);
            }
            TTarget::Cvar(name) => {
                self.push(Op::StoreCvar(name.clone(), v), Type::Unit);
            }
            TTarget::Attr { recv, name } => {
                let r = self.lower_expr(recv)?;
                self.push(
                    Op::CallMethod {
                        recv: Some(r),
                        method: format!("{}=", name),
                        args: vec![v],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Unit,
                );
            }
            TTarget::Index { recv, index } => {
                let r = self.lower_expr(recv)?;
                let i = self.lower_expr(index)?;
                self.push(
                    Op::CallMethod {
                        recv: Some(r),
                        method: "[]=".to_string(),
                        args: vec![i, v],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Unit,
                );
            }
        }
        Ok(())
    }

    /// Read the current value of a target, evaluating any receiver exactly
    /// once and returning it for the write-back.
    fn lower_target_read(
        &mut self,
        target: &TTarget,
        ty: &Type,
    ) -> Result<(ValueId, ReadBack), String> {
        match target {
            TTarget::Local(name) => {
                let id = self.local(name, ty);
                Ok((self.load_slot(id, ty), ReadBack::Local(id)))
            }
            TTarget::Ivar(name) => Ok((
                self.push(Op::LoadIvar(name.clone()), ty.clone()),
                ReadBack::Ivar(name.clone()),
            )),
            TTarget::Gvar(name) => Ok((
                self.push(Op::LoadGvar(name.clone()), ty.clone()),
                ReadBack::Gvar(name.clone()),
            )),
            TTarget::Cvar(name) => Ok((
                self.push(Op::LoadCvar(name.clone()), ty.clone()),
                ReadBack::Cvar(name.clone()),
            )),
            TTarget::Attr { recv, name } => {
                let r = self.lower_expr(recv)?;
                let read = self.push(
                    Op::CallMethod {
                        recv: Some(r),
                        method: name.clone(),
                        args: vec![],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    ty.clone(),
                );
                Ok((read, ReadBack::Attr { recv: r, name: name.clone() }))
            }
            TTarget::Index { recv, index } => {
                let r = self.lower_expr(recv)?;
                let i = self.lower_expr(index)?;
                let read = self.push(
                    Op::CallMethod {
                        recv: Some(r),
                        method: "[]".to_string(),
                        args: vec![i],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    ty.clone(),
                );
                Ok((read, ReadBack::Index { recv: r, index: i }))
            }
        }
    }

    fn write_back(&mut self, rb: &ReadBack, v: ValueId) {
        match rb {
            ReadBack::Local(id) => self.store_slot(*id, v),
            ReadBack::Ivar(name) => {
                self.push(Op::StoreIvar(name.clone(), v), Type::Unit);
            }
            ReadBack::Gvar(name) => {
                self.push(Op::StoreGvar(name.clone(), v), Type::Unit);
            }
            ReadBack::Cvar(name) => {
                self.push(Op::StoreCvar(name.clone(), v), Type::Unit);
            }
            ReadBack::Attr { recv, name } => {
                self.push(
                    Op::CallMethod {
                        recv: Some(*recv),
                        method: format!("{}=", name),
                        args: vec![v],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Unit,
                );
            }
            ReadBack::Index { recv, index } => {
                self.push(
                    Op::CallMethod {
                        recv: Some(*recv),
                        method: "[]=".to_string(),
                        args: vec![*index, v],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Unit,
                );
            }
        }
    }

    /// `x op= e` desugars into read, `op` call, write.
    fn lower_op_assign(
        &mut self,
        target: &TTarget,
        op: &str,
        value: &TExpr,
        ty: &Type,
    ) -> Result<ValueId, String> {
        let (read, rb) = self.lower_target_read(target, ty)?;
        let v = self.lower_expr(value)?;
        let result = self.push(
            Op::CallMethod {
                recv: Some(read),
                method: op.to_string(),
                args: vec![v],
                kwargs: vec![],
                block_fn: None,
                safe: false,
            },
            ty.clone(),
        );
        self.write_back(&rb, result);
        Ok(result)
    }

    /// `x ||= e` writes only when the read is falsy; `x &&= e` the opposite.
    fn lower_cond_assign(
        &mut self,
        target: &TTarget,
        value: &TExpr,
        ty: &Type,
        write_when_falsy: bool,
    ) -> Result<ValueId, String> {
        let (read, rb) = self.lower_target_read(target, ty)?;
        let write_l = self.fresh_label("condw");
        let skip_l = self.fresh_label("condskip");
        let merge_l = self.fresh_label("condmerge");
        let (then_l, else_l) = if write_when_falsy {
            (skip_l.clone(), write_l.clone())
        } else {
            (write_l.clone(), skip_l.clone())
        };
        self.seal(Terminator::Branch {
            cond: read,
            then_label: then_l,
            else_label: else_l,
        });

        self.start(write_l.clone());
        let v = self.lower_expr(value)?;
        let mut incomings = Vec::new();
        if self.fr().unreachable {
            self.seal(Terminator::Jump("exit".to_string()));
        } else {
            self.write_back(&rb, v);
            incomings.push((self.fr().cur_label.clone(), v));
            self.seal(Terminator::Jump(merge_l.clone()));
        }

        self.start(skip_l.clone());
        self.seal(Terminator::Jump(merge_l.clone()));
        incomings.push((skip_l, read));

        self.start(merge_l);
        Ok(self.push(Op::Phi { incomings }, ty.clone()))
    }

    /// `a, b, *rest, c = expr`: evaluate once, coerce to array, assign by
    /// index with a rest slice where present.
    fn lower_multi_assign(
        &mut self,
        targets: &[TMlhs],
        value: &TExpr,
    ) -> Result<ValueId, String> {
        let v = self.lower_expr(value)?;
        let ary = self.push(Op::ToArray(v), Type::Array);

        let splat_at = targets.iter().position(|t| matches!(t, TMlhs::Splat(_)));
        let (pre, rest, post): (&[TMlhs], Option<&TMlhs>, &[TMlhs]) = match splat_at {
            Some(i) => (&targets[..i], Some(&targets[i]), &targets[i + 1..]),
            None => (targets, None, &[]),
        };

        for (i, t) in pre.iter().enumerate() {
            if let TMlhs::Target(t) = t {
                let el = self.push(Op::ArrayGet { ary, index: i as i64 }, Type::Value);
                self.lower_store(t, el, &Type::Value)?;
            }
        }
        if let Some(TMlhs::Splat(name)) = rest {
            if let Some(name) = name {
                let slice = self.push(
                    Op::ArraySlice {
                        ary,
                        start: pre.len() as i64,
                        drop_back: post.len() as i64,
                    },
                    Type::Array,
                );
                let id = self.local(name, &Type::Array);
                self.store_slot(id, slice);
            }
        }
        for (i, t) in post.iter().enumerate() {
            if let TMlhs::Target(t) = t {
                let idx = -((post.len() - i) as i64);
                let el = self.push(Op::ArrayGet { ary, index: idx }, Type::Value);
                self.lower_store(t, el, &Type::Value)?;
            }
        }
        Ok(v)
    }

    // ---- control flow ---------------------------------------------------

    fn lower_if(
        &mut self,
        cond: &TExpr,
        then_body: &[TExpr],
        else_body: &[TExpr],
        ty: &Type,
    ) -> Result<ValueId, String> {
        let c = self.lower_expr(cond)?;
        let then_l = self.fresh_label("then");
        let else_l = self.fresh_label("else");
        let merge_l = self.fresh_label("merge");
        self.seal(Terminator::Branch {
            cond: c,
            then_label: then_l.clone(),
            else_label: else_l.clone(),
        });

        let mut incomings = Vec::new();

        self.start(then_l);
        let tv = self.lower_body(then_body)?;
        if self.fr().unreachable {
            self.seal(Terminator::Jump("exit".to_string()));
        } else {
            let v = match tv {
                Some(v) => v,
                None => self.push(Op::ConstNil, Type::Nil),
            };
            incomings.push((self.fr().cur_label.clone(), v));
            self.seal(Terminator::Jump(merge_l.clone()));
        }

        self.start(else_l);
        let ev = self.lower_body(else_body)?;
        if self.fr().unreachable {
            self.seal(Terminator::Jump("exit".to_string()));
        } else {
            let v = match ev {
                Some(v) => v,
                None => self.push(Op::ConstNil, Type::Nil),
            };
            incomings.push((self.fr().cur_label.clone(), v));
            self.seal(Terminator::Jump(merge_l.clone()));
        }

        if incomings.is_empty() {
            self.start_unreachable(merge_l);
            return Ok(self.push(Op::ConstNil, Type::Nil));
        }
        self.start(merge_l);
        Ok(self.push(Op::Phi { incomings }, ty.clone()))
    }

    /// Loops lower to preheader/condition/body/exit blocks; `break` jumps
    /// to the exit, `next` to the condition.
    fn lower_while(
        &mut self,
        cond: &TExpr,
        body: &[TExpr],
        negated: bool,
    ) -> Result<ValueId, String> {
        let pre_l = self.fresh_label("preheader");
        let cond_l = self.fresh_label("loopcond");
        let body_l = self.fresh_label("loopbody");
        let exit_l = self.fresh_label("loopexit");

        self.seal(Terminator::Jump(pre_l.clone()));
        self.start(pre_l);
        self.seal(Terminator::Jump(cond_l.clone()));

        self.start(cond_l.clone());
        let c = self.lower_expr(cond)?;
        let (t, f) = if negated {
            (exit_l.clone(), body_l.clone())
        } else {
            (body_l.clone(), exit_l.clone())
        };
        self.seal(Terminator::Branch { cond: c, then_label: t, else_label: f });

        self.start(body_l);
        self.fr().loop_stack.push((cond_l.clone(), exit_l.clone()));
        self.lower_body(body)?;
        self.fr().loop_stack.pop();
        self.seal(Terminator::Jump(cond_l));

        self.start(exit_l);
        Ok(self.push(Op::ConstNil, Type::Nil))
    }

    fn lower_and_or(
        &mut self,
        lhs: &TExpr,
        rhs: &TExpr,
        ty: &Type,
        is_and: bool,
    ) -> Result<ValueId, String> {
        let l = self.lower_expr(lhs)?;
        let l_label = self.fr().cur_label.clone();
        let rhs_l = self.fresh_label(if is_and { "andrhs" } else { "orrhs" });
        let merge_l = self.fresh_label("merge");
        let (t, f) = if is_and {
            (rhs_l.clone(), merge_l.clone())
        } else {
            (merge_l.clone(), rhs_l.clone())
        };
        self.seal(Terminator::Branch { cond: l, then_label: t, else_label: f });

        self.start(rhs_l);
        let r = self.lower_expr(rhs)?;
        let mut incomings = vec![(l_label, l)];
        if self.fr().unreachable {
            self.seal(Terminator::Jump("exit".to_string()));
        } else {
            incomings.push((self.fr().cur_label.clone(), r));
            self.seal(Terminator::Jump(merge_l.clone()));
        }

        self.start(merge_l);
        Ok(self.push(Op::Phi { incomings }, ty.clone()))
    }

    // ---- calls ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn lower_call(
        &mut self,
        e: &TExpr,
        receiver: Option<&TExpr>,
        recv_kind: ReceiverKind,
        method: &str,
        args: &[TExpr],
        kwargs: &[(String, TExpr)],
        block: Option<&crate::tast::TBlock>,
        dispatch: &Dispatch,
    ) -> Result<ValueId, String> {
        // fiber intrinsics on the Fiber constant
        if let Some(TExpr { kind: TExprKind::ConstGet(c), .. }) = receiver {
            if c == "Fiber" {
                match method {
                    "new" => {
                        let b = block.ok_or("Fiber.new requires a block")?;
                        let key = self.outline(
                            FnKind::FiberBody { parent: self.root_key.clone() },
                            &block_params_of(b),
                            &b.body,
                            false,
                            Type::Value,
                        )?;
                        return Ok(self.push(
                            Op::FiberNew { body_fn: key },
                            Type::Class { name: "Fiber".into(), args: vec![] },
                        ));
                    }
                    "yield" => {
                        let vals = args
                            .iter()
                            .map(|a| self.lower_expr(a))
                            .collect::<Result<Vec<_>, _>>()?;
                        let v = self.push(Op::FiberYield { args: vals }, e.ty.clone());
                        // the resume argument flows back into the yield
                        // expression; a slot is allocated even when the
                        // result is unnamed so no store is left undefined
                        let slot = self.local("__fiber_resumed", &Type::Value);
                        self.store_slot(slot, v);
                        return Ok(v);
                    }
                    _ => {}
                }
            }
        }

        // safe navigation: nil receiver short-circuits to nil
        if recv_kind == ReceiverKind::SafeNav {
            let r = self.lower_expr(receiver.unwrap())?;
            let is_nil = self.push(
                Op::KindOf { value: r, class_name: "NilClass".to_string() },
                Type::Bool,
            );
            let nil_l = self.fresh_label("safenil");
            let call_l = self.fresh_label("safecall");
            let merge_l = self.fresh_label("merge");
            self.seal(Terminator::Branch {
                cond: is_nil,
                then_label: nil_l.clone(),
                else_label: call_l.clone(),
            });
            self.start(nil_l.clone());
            let n = self.push(Op::ConstNil, Type::Nil);
            self.seal(Terminator::Jump(merge_l.clone()));
            self.start(call_l);
            let c = self.lower_call_dispatch(e, Some(r), method, args, kwargs, block, dispatch)?;
            let call_end = self.fr().cur_label.clone();
            self.seal(Terminator::Jump(merge_l.clone()));
            self.start(merge_l);
            return Ok(self.push(
                Op::Phi { incomings: vec![(nil_l, n), (call_end, c)] },
                e.ty.clone(),
            ));
        }

        let recv = match receiver {
            Some(r) => Some(self.lower_expr(r)?),
            None => None,
        };
        self.lower_call_dispatch(e, recv, method, args, kwargs, block, dispatch)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_call_dispatch(
        &mut self,
        e: &TExpr,
        recv: Option<ValueId>,
        method: &str,
        args: &[TExpr],
        kwargs: &[(String, TExpr)],
        block: Option<&crate::tast::TBlock>,
        dispatch: &Dispatch,
    ) -> Result<ValueId, String> {
        let arg_vals = args
            .iter()
            .map(|a| self.lower_expr(a))
            .collect::<Result<Vec<_>, _>>()?;
        let mut kw_vals = Vec::with_capacity(kwargs.len());
        for (k, v) in kwargs {
            kw_vals.push((k.clone(), self.lower_expr(v)?));
        }
        let block_fn = match block {
            Some(b) => Some(self.outline(
                FnKind::BlockBody { parent: self.root_key.clone() },
                &block_params_of(b),
                &b.body,
                b.is_lambda,
                Type::Value,
            )?),
            None => None,
        };
        let had_block = block_fn.is_some();

        let result = match dispatch {
            Dispatch::Direct { key } => {
                let mut all = Vec::with_capacity(arg_vals.len() + kw_vals.len());
                all.extend(&arg_vals);
                if !kw_vals.is_empty() {
                    let mut pairs = Vec::with_capacity(kw_vals.len());
                    for (k, v) in &kw_vals {
                        let key = self.push(Op::ConstSym(k.clone()), Type::Symbol);
                        pairs.push((key, *v));
                    }
                    let h = self.push(Op::HashNew(pairs), Type::Hash);
                    all.push(h);
                }
                let ty = self.meta.get(key).cloned().unwrap_or_else(|| e.ty.clone());
                self.push(Op::CallFn { key: key.clone(), args: all }, ty)
            }
            Dispatch::Native { class, vtable } => {
                let r = recv.ok_or("native call without a receiver")?;
                self.push(
                    Op::NativeCall {
                        class: class.clone(),
                        method: method.to_string(),
                        recv: r,
                        args: arg_vals,
                        vtable: *vtable,
                    },
                    e.ty.clone(),
                )
            }
            Dispatch::Cfunc { symbol } => {
                let r = recv.ok_or("cfunc call without a receiver")?;
                self.push(
                    Op::CfuncCall {
                        symbol: symbol.clone(),
                        recv: r,
                        args: arg_vals,
                    },
                    e.ty.clone(),
                )
            }
            Dispatch::Generic => self.push(
                Op::CallMethod {
                    recv,
                    method: method.to_string(),
                    args: arg_vals,
                    kwargs: kw_vals,
                    block_fn,
                    safe: false,
                },
                e.ty.clone(),
            ),
        };

        // a block body may have executed `return`; unwind through the
        // shared flag
        if had_block {
            self.emit_ret_flag_check();
        }
        Ok(result)
    }

    // ---- raise ----------------------------------------------------------

    pub(super) fn lower_raise(&mut self, args: &[TExpr]) -> Result<ValueId, String> {
        match args {
            [] => {
                self.seal(Terminator::Raise(RaiseKind::Rethrow));
            }
            [one] => {
                let v = self.lower_expr(one)?;
                let exc = if one.ty == Type::Str {
                    // `raise "message"` raises a RuntimeError
                    let cls = self.push(Op::LoadConst("RuntimeError".to_string()), Type::Value);
                    self.push(
                        Op::CallMethod {
                            recv: Some(cls),
                            method: "new".to_string(),
                            args: vec![v],
                            kwargs: vec![],
                            block_fn: None,
                            safe: false,
                        },
                        Type::Value,
                    )
                } else {
                    v
                };
                self.seal(Terminator::Raise(RaiseKind::Value(exc)));
            }
            [cls, msg, ..] => {
                let c = self.lower_expr(cls)?;
                let m = self.lower_expr(msg)?;
                let exc = self.push(
                    Op::CallMethod {
                        recv: Some(c),
                        method: "new".to_string(),
                        args: vec![m],
                        kwargs: vec![],
                        block_fn: None,
                        safe: false,
                    },
                    Type::Value,
                );
                self.seal(Terminator::Raise(RaiseKind::Value(exc)));
            }
        }
        let dead = self.fresh_label("dead");
        self.start_unreachable(dead);
        Ok(self.push(Op::ConstNil, Type::Nil))
    }
}

/// Where a compound write puts its result back.
enum ReadBack {
    Local(LocalId),
    Ivar(String),
    Gvar(String),
    Cvar(String),
    Attr { recv: ValueId, name: String },
    Index { recv: ValueId, index: ValueId },
}
