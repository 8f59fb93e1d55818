//! Optimization passes over HIR
//!
//! Passes mutate the program in place by structural edits only. Order
//! matters: the inliner exposes more call sites to the monomorphizer, and
//! the phi promoter runs last so it sees the final merge structure. The
//! validator re-checks the program after the passes.

pub mod call_graph;
pub mod inline;
pub mod licm;
pub mod monomorphize;
pub mod phi_promote;

use crate::hir::{validate, Program};

pub fn run(program: &mut Program) -> Result<(), String> {
    inline::run(program)?;
    licm::run(program)?;
    monomorphize::run(program)?;
    phi_promote::run(program);
    validate::validate(program)?;
    Ok(())
}
