//! Exception-region synthesis
//!
//! A `Rescue` instruction becomes a pair of synthesized functions appended
//! after the module body: a region proxy that runs the protected body under
//! the host's `rb_rescue2` (with the explicit list of rescued class
//! handles) and then the `else` body on the no-exception path, and a
//! handler trampoline that dispatches the raised value over the rescue arms
//! by class membership, re-raising when nothing matches. `ensure` wraps the
//! proxy with the host's `rb_ensure`, which guarantees the ensure body runs
//! exactly once on every exit path.

use super::*;
use std::fmt::Write as _;

impl<'a> Emitter<'a> {
    pub(super) fn emit_rescue_region(
        &mut self,
        body_fn: &str,
        arms: &[RescueArm],
        else_fn: Option<&str>,
        ensure_fn: Option<&str>,
        completed_slot: usize,
    ) -> Result<EVal, String> {
        let env = self
            .cur_env
            .clone()
            .ok_or("protected region outside an environment-carrying function")?;
        let n = self.region_n;
        self.region_n += 1;
        let parent = self
            .cur_fn
            .map(|f| mangle(&f.key))
            .unwrap_or_else(|| "anon".to_string());
        let proxy = format!("kp_region_{}_{}", parent, n);
        let handler = format!("{}_handler", proxy);

        self.synthesize_proxy(&proxy, &handler, body_fn, arms, else_fn, completed_slot);
        self.synthesize_handler(&handler, arms);

        let t = self.fresh();
        match ensure_fn {
            Some(e) => {
                let esym = symbol_for(e);
                self.line(&format!(
                    "{} = call i64 @rb_ensure(ptr @{}, i64 {}, ptr @{}, i64 {})",
                    t, proxy, env, esym, env
                ));
            }
            None => {
                self.line(&format!("{} = call i64 @{}(i64 {})", t, proxy, env));
            }
        }
        Ok(EVal::new(t, Repr::Boxed))
    }

    /// The proxy: rb_rescue2 over the protected body with the rescued class
    /// handles, then the `else` body when the completed flag is set.
    fn synthesize_proxy(
        &mut self,
        proxy: &str,
        handler: &str,
        body_fn: &str,
        arms: &[RescueArm],
        else_fn: Option<&str>,
        completed_slot: usize,
    ) {
        let body_sym = symbol_for(body_fn);
        let mut a = String::new();
        let mut tn = 0usize;
        let mut fresh = |a: &mut String| {
            let _ = a;
            tn += 1;
            format!("%r{}", tn - 1)
        };

        let _ = writeln!(a, "define i64 @{}(i64 %env) {{", proxy);
        // resolve every rescued class handle up front
        let mut class_handles: Vec<String> = Vec::new();
        let all_classes: Vec<&str> = arms
            .iter()
            .flat_map(|arm| arm.classes.iter().map(String::as_str))
            .collect();
        for class in &all_classes {
            let mut cur = fresh(&mut a);
            let _ = writeln!(a, "  {} = load i64, ptr @rb_cObject", cur);
            for part in class.split("::") {
                let g = self.string_global(part);
                let id = fresh(&mut a);
                let _ = writeln!(a, "  {} = call i64 @rb_intern(ptr {})", id, g);
                let next = fresh(&mut a);
                let _ = writeln!(
                    a,
                    "  {} = call i64 @rb_const_get(i64 {}, i64 {})",
                    next, cur, id
                );
                cur = next;
            }
            class_handles.push(cur);
        }
        let r = fresh(&mut a);
        let handle_args: Vec<String> =
            class_handles.iter().map(|h| format!("i64 {}", h)).collect();
        let _ = writeln!(
            a,
            "  {} = call i64 (ptr, i64, ptr, i64, ...) @rb_rescue2(ptr @{}, i64 %env, ptr @{}, i64 %env{}{}, i64 0)",
            r,
            body_sym,
            handler,
            if handle_args.is_empty() { "" } else { ", " },
            handle_args.join(", ")
        );
        match else_fn {
            None => {
                let _ = writeln!(a, "  ret i64 {}", r);
            }
            Some(e) => {
                // the else body runs only when the protected body completed
                // without raising
                let esym = symbol_for(e);
                let cf = fresh(&mut a);
                let _ = writeln!(
                    a,
                    "  {} = call i64 @rb_ary_entry(i64 %env, i64 {})",
                    cf, completed_slot
                );
                let m = fresh(&mut a);
                let _ = writeln!(a, "  {} = and i64 {}, -9", m, cf);
                let c = fresh(&mut a);
                let _ = writeln!(a, "  {} = icmp ne i64 {}, 0", c, m);
                let _ = writeln!(a, "  br i1 {}, label %run_else, label %done", c);
                let _ = writeln!(a, "run_else:");
                let er = fresh(&mut a);
                let _ = writeln!(a, "  {} = call i64 @{}(i64 %env)", er, esym);
                let _ = writeln!(a, "  ret i64 {}", er);
                let _ = writeln!(a, "done:");
                let _ = writeln!(a, "  ret i64 {}", r);
            }
        }
        a.push_str("}\n\n");
        self.aux.push_str(&a);
    }

    /// The handler trampoline: class-membership dispatch over the arms in
    /// order; an unmatched exception re-raises to the next enclosing
    /// handler.
    fn synthesize_handler(&mut self, handler: &str, arms: &[RescueArm]) {
        let mut a = String::new();
        let mut tn = 0usize;
        let mut fresh = || {
            tn += 1;
            format!("%h{}", tn - 1)
        };

        let _ = writeln!(a, "define i64 @{}(i64 %env, i64 %exc) {{", handler);
        let _ = writeln!(a, "  br label %arm0");
        for (i, arm) in arms.iter().enumerate() {
            let _ = writeln!(a, "arm{}:", i);
            let next = if i + 1 == arms.len() {
                "reraise".to_string()
            } else {
                format!("arm{}", i + 1)
            };
            // any of the arm's classes admits the exception
            let mut checks: Vec<String> = Vec::new();
            for class in &arm.classes {
                let mut cur = fresh();
                let _ = writeln!(a, "  {} = load i64, ptr @rb_cObject", cur);
                for part in class.split("::") {
                    let g = self.string_global(part);
                    let id = fresh();
                    let _ = writeln!(a, "  {} = call i64 @rb_intern(ptr {})", id, g);
                    let nx = fresh();
                    let _ = writeln!(
                        a,
                        "  {} = call i64 @rb_const_get(i64 {}, i64 {})",
                        nx, cur, id
                    );
                    cur = nx;
                }
                let k = fresh();
                let _ = writeln!(
                    a,
                    "  {} = call i64 @rb_obj_is_kind_of(i64 %exc, i64 {})",
                    k, cur
                );
                let m = fresh();
                let _ = writeln!(a, "  {} = and i64 {}, -9", m, k);
                let c = fresh();
                let _ = writeln!(a, "  {} = icmp ne i64 {}, 0", c, m);
                checks.push(c);
            }
            let cond = if checks.len() == 1 {
                checks[0].clone()
            } else {
                let mut acc = checks[0].clone();
                for c in &checks[1..] {
                    let o = fresh();
                    let _ = writeln!(a, "  {} = or i1 {}, {}", o, acc, c);
                    acc = o;
                }
                acc
            };
            let _ = writeln!(
                a,
                "  br i1 {}, label %run{}, label %{}",
                cond, i, next
            );
            let _ = writeln!(a, "run{}:", i);
            let sym = symbol_for(&arm.handler_fn);
            let r = fresh();
            let _ = writeln!(a, "  {} = call i64 @{}(i64 %env, i64 %exc)", r, sym);
            let _ = writeln!(a, "  ret i64 {}", r);
        }
        let _ = writeln!(a, "reraise:");
        let _ = writeln!(a, "  call void @rb_exc_raise(i64 %exc)");
        let _ = writeln!(a, "  unreachable");
        a.push_str("}\n\n");
        self.aux.push_str(&a);
    }
}
