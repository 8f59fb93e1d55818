//! Host C API declarations for LLVM IR.
//!
//! Every host-interpreter entry point the emitter may call is declared here
//! in a single data-driven table, so the declaration block stays consistent
//! and deterministic across compilations. `VALUE` and `ID` are both `i64`
//! at this ABI.

use std::sync::LazyLock;

/// One external declaration in the IR prelude.
pub struct RuntimeDecl {
    /// Full LLVM declaration line
    pub decl: &'static str,
    /// Optional category comment emitted above the declaration
    pub category: Option<&'static str>,
}

pub static RUNTIME_DECLARATIONS: LazyLock<Vec<RuntimeDecl>> = LazyLock::new(|| {
    vec![
        // boxing
        RuntimeDecl {
            decl: "declare i64 @rb_ll2inum(i64)",
            category: Some("; Boxing and unboxing"),
        },
        RuntimeDecl { decl: "declare i64 @rb_num2ll(i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_float_new(double)", category: None },
        RuntimeDecl { decl: "declare double @rb_num2dbl(i64)", category: None },
        // strings and symbols
        RuntimeDecl {
            decl: "declare i64 @rb_str_new_cstr(ptr)",
            category: Some("; Strings, symbols, interning"),
        },
        RuntimeDecl { decl: "declare i64 @rb_intern(ptr)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_id2sym(i64)", category: None },
        // dispatch
        RuntimeDecl {
            decl: "declare i64 @rb_funcallv(i64, i64, i32, ptr)",
            category: Some("; Dispatch"),
        },
        RuntimeDecl {
            decl: "declare i64 @rb_block_call(i64, i64, i32, ptr, ptr, i64)",
            category: None,
        },
        RuntimeDecl { decl: "declare i64 @rb_call_super(i32, ptr)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_yield_values2(i32, ptr)", category: None },
        RuntimeDecl { decl: "declare i32 @rb_block_given_p()", category: None },
        // objects and classes
        RuntimeDecl {
            decl: "declare i64 @rb_const_get(i64, i64)",
            category: Some("; Objects and classes"),
        },
        RuntimeDecl { decl: "declare void @rb_const_set(i64, i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_obj_class(i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_obj_is_kind_of(i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_equal(i64, i64)", category: None },
        RuntimeDecl { decl: "declare ptr @rb_check_typeddata(i64, ptr)", category: None },
        // variables
        RuntimeDecl {
            decl: "declare i64 @rb_gv_get(ptr)",
            category: Some("; Global, instance, class variables"),
        },
        RuntimeDecl { decl: "declare i64 @rb_gv_set(ptr, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_ivar_get(i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_ivar_set(i64, i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_cvar_get(i64, i64)", category: None },
        RuntimeDecl { decl: "declare void @rb_cvar_set(i64, i64, i64)", category: None },
        // arrays
        RuntimeDecl {
            decl: "declare i64 @rb_ary_new_from_values(i64, ptr)",
            category: Some("; Arrays"),
        },
        RuntimeDecl { decl: "declare i64 @rb_ary_new_capa(i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_ary_entry(i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_ary_store(i64, i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_ary_subseq(i64, i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_array_len(i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_Array(i64)", category: None },
        // hashes
        RuntimeDecl {
            decl: "declare i64 @rb_hash_new()",
            category: Some("; Hashes"),
        },
        RuntimeDecl { decl: "declare i64 @rb_hash_aset(i64, i64, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_hash_aref(i64, i64)", category: None },
        RuntimeDecl {
            decl: "declare i64 @rb_hash_lookup2(i64, i64, i64)",
            category: None,
        },
        // ranges and regexps
        RuntimeDecl {
            decl: "declare i64 @rb_range_new(i64, i64, i32)",
            category: Some("; Ranges and regexps"),
        },
        RuntimeDecl { decl: "declare i64 @rb_reg_new(ptr, i64, i32)", category: None },
        // procs and fibers
        RuntimeDecl {
            decl: "declare i64 @rb_proc_new(ptr, i64)",
            category: Some("; Procs and fibers"),
        },
        RuntimeDecl { decl: "declare i64 @rb_fiber_new(ptr, i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_fiber_yield(i32, ptr)", category: None },
        // exceptions
        RuntimeDecl {
            decl: "declare i64 @rb_rescue2(ptr, i64, ptr, i64, ...)",
            category: Some("; Exceptions"),
        },
        RuntimeDecl { decl: "declare i64 @rb_ensure(ptr, i64, ptr, i64)", category: None },
        RuntimeDecl { decl: "declare void @rb_exc_raise(i64)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_errinfo()", category: None },
        RuntimeDecl { decl: "declare void @rb_raise(i64, ptr, ...)", category: None },
        RuntimeDecl { decl: "declare i64 @rb_exc_new_str(i64, i64)", category: None },
    ]
});

/// External globals of the host: well-known class and error handles.
pub static RUNTIME_GLOBALS: &[&str] = &[
    "@rb_cObject = external global i64",
    "@rb_eArgError = external global i64",
    "@rb_eZeroDivError = external global i64",
    "@rb_eNoMatchingPatternError = external global i64",
    "@rb_eRuntimeError = external global i64",
];

/// Tagged constants of the host's value representation (64-bit, flonum
/// build): false, true, nil, and the undefined sentinel.
pub const QFALSE: i64 = 0x00;
pub const QTRUE: i64 = 0x14;
pub const QNIL: i64 = 0x08;
pub const QUNDEF: i64 = 0x24;

/// Render the whole declaration prelude.
pub fn prelude() -> String {
    let mut out = String::new();
    for g in RUNTIME_GLOBALS {
        out.push_str(g);
        out.push('\n');
    }
    out.push('\n');
    for d in RUNTIME_DECLARATIONS.iter() {
        if let Some(cat) = d.category {
            out.push_str(cat);
            out.push('\n');
        }
        out.push_str(d.decl);
        out.push('\n');
    }
    out
}

/// Profiling runtime hooks, declared only when profiling is enabled.
pub fn profiling_decls() -> &'static str {
    "declare i64 @kp_prof_enter(ptr)\ndeclare void @kp_prof_exit(ptr, i64)\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_contains_core_helpers() {
        let p = prelude();
        assert!(p.contains("declare i64 @rb_funcallv(i64, i64, i32, ptr)"));
        assert!(p.contains("declare i64 @rb_ll2inum(i64)"));
        assert!(p.contains("declare i64 @rb_hash_lookup2(i64, i64, i64)"));
        assert!(p.contains("@rb_eArgError = external global i64"));
    }

    #[test]
    fn test_tagged_constants() {
        assert_eq!(QFALSE, 0);
        assert_eq!(QNIL, 8);
        assert_eq!(QTRUE, 20);
        assert_eq!(QUNDEF, 36);
    }
}
