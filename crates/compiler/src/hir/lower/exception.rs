//! `begin/rescue/else/ensure` lowering
//!
//! A protected region outlines its body, each rescue clause, the `else`
//! body, and the `ensure` body into callback functions sharing the
//! enclosing frame's environment. The single `Rescue` instruction carries
//! them; the emitter realizes it with the host's `rb_rescue2`/`rb_ensure`
//! trampolines. Each region owns a completed-flag env slot so nested
//! regions cannot confuse each other's `else` paths, and `return` inside
//! any outlined body unwinds through the shared return flag, which also
//! guarantees `ensure` runs exactly once on that path.

use super::*;
use crate::tast::{TExpr, TRescue};
use crate::types::Type;

impl RootLower<'_> {
    pub(super) fn lower_begin(
        &mut self,
        body: &[TExpr],
        rescues: &[TRescue],
        else_body: &[TExpr],
        ensure_body: &[TExpr],
        ty: &Type,
    ) -> Result<ValueId, String> {
        // `begin ... end` with no handlers is just grouping
        if rescues.is_empty() && ensure_body.is_empty() {
            let mut seq: Vec<&[TExpr]> = vec![body];
            if !else_body.is_empty() {
                seq.push(else_body);
            }
            let mut last = None;
            for part in seq {
                last = self.lower_body(part)?;
            }
            return Ok(match last {
                Some(v) => v,
                None => self.push(Op::ConstNil, Type::Nil),
            });
        }

        let n = self.outline_counter;
        let completed = self.alloc_slot(&format!("__completed{}", n), &Type::Bool);
        let completed_slot = ENV_RESERVED + completed;
        let f = self.push(Op::ConstBool(false), Type::Bool);
        self.push(Op::StoreEnv(completed_slot, f), Type::Unit);

        let body_fn = self.outline_protected_body(body, completed_slot)?;

        let mut arms = Vec::with_capacity(rescues.len());
        for r in rescues {
            let binder = r.binder.clone().unwrap_or_else(|| "__exc".to_string());
            let handler_fn = self.outline(
                FnKind::RescueHandler { parent: self.root_key.clone() },
                &[(binder, ParamKind::Required, Type::Value)],
                &r.body,
                false,
                Type::Value,
            )?;
            let classes = if r.classes.is_empty() {
                vec!["StandardError".to_string()]
            } else {
                r.classes.clone()
            };
            arms.push(RescueArm { classes, handler_fn });
        }

        let else_fn = if else_body.is_empty() {
            None
        } else {
            Some(self.outline(
                FnKind::ElseBody { parent: self.root_key.clone() },
                &[],
                else_body,
                false,
                Type::Value,
            )?)
        };
        let ensure_fn = if ensure_body.is_empty() {
            None
        } else {
            Some(self.outline(
                FnKind::EnsureBody { parent: self.root_key.clone() },
                &[],
                ensure_body,
                false,
                Type::Value,
            )?)
        };

        let r = self.push(
            Op::Rescue {
                body_fn,
                arms,
                else_fn,
                ensure_fn,
                completed_slot,
            },
            ty.clone(),
        );
        // a `return` inside the region set the shared flag; unwind after
        // the ensure body has run
        self.emit_ret_flag_check();
        Ok(r)
    }

    /// Outline the protected body; on normal completion it sets this
    /// region's completed flag so the no-exception (`else`) path is
    /// distinguishable from a handled exception.
    fn outline_protected_body(
        &mut self,
        body: &[TExpr],
        completed_slot: usize,
    ) -> Result<String, String> {
        let n = self.outline_counter;
        self.outline_counter += 1;
        let key = format!("{}::body{}", self.root_key, n);
        let parent_map = self.fr().locals_map.clone();
        self.push_frame(
            key.clone(),
            key.clone(),
            FnKind::ProtectedBody { parent: self.root_key.clone() },
            Type::Value,
            parent_map,
        );
        let v = self.lower_body(body)?;
        if !self.fr().unreachable {
            let t = self.push(Op::ConstBool(true), Type::Bool);
            self.push(Op::StoreEnv(completed_slot, t), Type::Unit);
        }
        self.finish_frame_with(v);
        Ok(key)
    }
}
