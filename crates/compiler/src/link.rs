//! Assembling and linking
//!
//! Writes the IR to disk, runs the LLVM optimizer when available (emission
//! proceeds without it otherwise), lowers to an object file with `llc`,
//! compiles the generated C shim against the host's headers, and links a
//! position-independent shared library. Libraries named by `ffi`
//! annotations add `-l` flags. When profiling is enabled, the embedded
//! profile runtime compiles in alongside.
//!
//! Missing tools are fatal with a platform-specific install hint.

use crate::config::CompilerConfig;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Small always-linked C runtime for `--profile`: per-function call counts
/// and nanosecond totals, flushed as JSON at process exit.
const PROFILE_RUNTIME_C: &str = r#"/* konpeito profile runtime */
#include <stdio.h>
#include <stdlib.h>
#include <string.h>
#include <stdint.h>
#include <time.h>

#define KP_PROF_SLOTS 1024

struct kp_prof_entry {
    const char *name;
    uint64_t calls;
    uint64_t nanos;
};

static struct kp_prof_entry kp_prof_table[KP_PROF_SLOTS];
static const char *kp_prof_path = "konpeito_profile.json";

static uint64_t kp_now(void) {
    struct timespec ts;
    clock_gettime(CLOCK_MONOTONIC, &ts);
    return (uint64_t)ts.tv_sec * 1000000000ull + (uint64_t)ts.tv_nsec;
}

static struct kp_prof_entry *kp_slot(const char *name) {
    uint64_t h = 1469598103934665603ull;
    for (const char *p = name; *p; p++) h = (h ^ (uint64_t)*p) * 1099511628211ull;
    for (int i = 0; i < KP_PROF_SLOTS; i++) {
        struct kp_prof_entry *e = &kp_prof_table[(h + i) % KP_PROF_SLOTS];
        if (e->name == name || e->name == NULL || strcmp(e->name, name) == 0) {
            e->name = name;
            return e;
        }
    }
    return &kp_prof_table[h % KP_PROF_SLOTS];
}

int64_t kp_prof_enter(const char *name) {
    kp_slot(name)->calls++;
    return (int64_t)kp_now();
}

void kp_prof_exit(const char *name, int64_t t0) {
    kp_slot(name)->nanos += kp_now() - (uint64_t)t0;
}

static void kp_prof_flush(void) {
    FILE *f = fopen(kp_prof_path, "w");
    if (!f) return;
    fprintf(f, "{\n");
    int first = 1;
    for (int i = 0; i < KP_PROF_SLOTS; i++) {
        struct kp_prof_entry *e = &kp_prof_table[i];
        if (!e->name || e->calls == 0) continue;
        if (!first) fprintf(f, ",\n");
        first = 0;
        fprintf(f, "  \"%s\": { \"calls\": %llu, \"nanos\": %llu }",
                e->name, (unsigned long long)e->calls, (unsigned long long)e->nanos);
    }
    fprintf(f, "\n}\n");
    fclose(f);
}

void kp_prof_init(const char *path) {
    kp_prof_path = strdup(path);
    atexit(kp_prof_flush);
}
"#;

/// Locate the first of `candidates` on PATH.
pub fn find_tool(candidates: &[&str]) -> Option<String> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in candidates {
            let p = dir.join(name);
            if p.is_file() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Platform-specific install hint for a missing tool.
pub fn install_hint(tool: &str) -> String {
    if cfg!(target_os = "macos") {
        format!(
            "'{}' not found. Install the LLVM toolchain with: brew install llvm \
             (and add $(brew --prefix llvm)/bin to PATH)",
            tool
        )
    } else {
        format!(
            "'{}' not found. Install the LLVM toolchain with: \
             sudo apt install llvm clang (or your distribution's equivalent)",
            tool
        )
    }
}

/// Platform extension of the produced shared library.
pub fn shared_lib_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "bundle"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

fn run(cmd: &mut Command, what: &str) -> Result<(), String> {
    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run {}: {}", what, e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("{} failed:\n{}", what, stderr));
    }
    Ok(())
}

/// Compiler flags for the host interpreter's headers, queried from the
/// interpreter itself.
fn ruby_include_flags() -> Result<Vec<String>, String> {
    let ruby = find_tool(&["ruby"])
        .ok_or_else(|| "'ruby' not found. Install the host interpreter first.".to_string())?;
    let output = Command::new(&ruby)
        .arg("-e")
        .arg("print RbConfig::CONFIG['rubyhdrdir'], ' ', RbConfig::CONFIG['rubyarchhdrdir']")
        .output()
        .map_err(|e| format!("Failed to query ruby headers: {}", e))?;
    if !output.status.success() {
        return Err("Failed to query the host interpreter's header paths".to_string());
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .split_whitespace()
        .map(|d| format!("-I{}", d))
        .collect())
}

/// Assemble the IR and shim and link the final shared library.
///
/// `ir` and `shim_c` are the in-memory artifacts; intermediates live next
/// to `output` and are removed on success unless retention is requested.
pub fn assemble_and_link(
    ir: &str,
    shim_c: &str,
    output: &Path,
    config: &CompilerConfig,
    ffi_libs: &[String],
) -> Result<(), String> {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    let dir = output.parent().map(Path::to_path_buf).unwrap_or_default();
    let ll_path = dir.join(format!("{}.ll", stem));
    let obj_path = dir.join(format!("{}.o", stem));
    let shim_path = dir.join(format!("{}_shim.c", stem));
    let shim_obj = dir.join(format!("{}_shim.o", stem));
    let mut intermediates: Vec<PathBuf> =
        vec![ll_path.clone(), obj_path.clone(), shim_path.clone(), shim_obj.clone()];

    std::fs::write(&ll_path, ir)
        .map_err(|e| format!("Failed to write IR file: {}", e))?;
    std::fs::write(&shim_path, shim_c)
        .map_err(|e| format!("Failed to write shim file: {}", e))?;

    // optional LLVM optimizer pass; emission degrades gracefully without it
    let opt_input = match find_tool(&["opt", "opt-18", "opt-17", "opt-16", "opt-15"]) {
        Some(opt) => {
            let opt_path = dir.join(format!("{}.opt.ll", stem));
            let result = run(
                Command::new(&opt)
                    .arg("-S")
                    .arg(config.optimization_level.flag())
                    .arg(&ll_path)
                    .arg("-o")
                    .arg(&opt_path),
                "LLVM optimizer",
            );
            match result {
                Ok(()) => {
                    intermediates.push(opt_path.clone());
                    opt_path
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LLVM optimizer failed; continuing unoptimized");
                    ll_path.clone()
                }
            }
        }
        None => {
            tracing::warn!("LLVM optimizer not found; continuing unoptimized");
            ll_path.clone()
        }
    };

    // static compiler: required
    let llc = find_tool(&["llc", "llc-18", "llc-17", "llc-16", "llc-15"])
        .ok_or_else(|| install_hint("llc"))?;
    run(
        Command::new(&llc)
            .arg("-filetype=obj")
            .arg("-relocation-model=pic")
            .arg(&opt_input)
            .arg("-o")
            .arg(&obj_path),
        "LLVM static compiler",
    )?;

    // C compiler for the shim: required
    let cc = std::env::var("CC").ok().or_else(|| find_tool(&["cc", "clang", "gcc"]))
        .ok_or_else(|| install_hint("cc"))?;
    let include_flags = ruby_include_flags()?;
    let mut shim_cc = Command::new(&cc);
    shim_cc.arg("-c").arg("-fPIC").args(&include_flags);
    if config.debug_symbols {
        shim_cc.arg("-g");
    }
    shim_cc.arg(&shim_path).arg("-o").arg(&shim_obj);
    run(&mut shim_cc, "C compiler (shim)")?;

    // profile runtime object, when enabled
    let mut prof_obj: Option<PathBuf> = None;
    if config.profile {
        let prof_c = dir.join(format!("{}_prof.c", stem));
        let prof_o = dir.join(format!("{}_prof.o", stem));
        std::fs::write(&prof_c, PROFILE_RUNTIME_C)
            .map_err(|e| format!("Failed to write profile runtime: {}", e))?;
        run(
            Command::new(&cc)
                .arg("-c")
                .arg("-fPIC")
                .arg(&prof_c)
                .arg("-o")
                .arg(&prof_o),
            "C compiler (profile runtime)",
        )?;
        intermediates.push(prof_c);
        intermediates.push(prof_o.clone());
        prof_obj = Some(prof_o);
    }

    // link through the C compiler; undefined host symbols resolve when the
    // interpreter loads the extension
    let mut link = Command::new(&cc);
    link.arg("-shared").arg("-o").arg(output).arg(&obj_path).arg(&shim_obj);
    if config.debug_symbols {
        link.arg("-g");
    }
    if let Some(p) = &prof_obj {
        link.arg(p);
    }
    if cfg!(target_os = "macos") {
        link.arg("-undefined").arg("dynamic_lookup");
    }
    for lp in &config.library_paths {
        link.arg("-L").arg(lp);
    }
    for lib in &config.libraries {
        link.arg("-l").arg(lib);
    }
    for lib in ffi_libs {
        link.arg("-l").arg(lib);
    }
    run(&mut link, "linker")?;

    // external debug bundle where the platform wants one
    if config.debug_symbols && cfg!(target_os = "macos") {
        match find_tool(&["dsymutil"]) {
            Some(d) => {
                if let Err(e) = run(Command::new(&d).arg(output), "dsymutil") {
                    tracing::warn!(error = %e, "could not produce the dSYM bundle");
                }
            }
            None => tracing::warn!("dsymutil not found; skipping the dSYM bundle"),
        }
    }

    if !config.keep_intermediates {
        for p in intermediates {
            let _ = std::fs::remove_file(p);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_hint_names_a_package_manager() {
        let hint = install_hint("llc");
        assert!(hint.contains("llc"));
        assert!(hint.contains("brew") || hint.contains("apt"));
    }

    #[test]
    fn test_shared_lib_extension_is_platform_shaped() {
        let ext = shared_lib_extension();
        assert!(matches!(ext, "so" | "bundle" | "dll"));
    }

    #[test]
    fn test_find_tool_missing() {
        assert!(find_tool(&["definitely-not-a-real-tool-name-xyz"]).is_none());
    }

    #[test]
    fn test_profile_runtime_source_shape() {
        assert!(PROFILE_RUNTIME_C.contains("kp_prof_enter"));
        assert!(PROFILE_RUNTIME_C.contains("kp_prof_exit"));
        assert!(PROFILE_RUNTIME_C.contains("kp_prof_init"));
        assert!(PROFILE_RUNTIME_C.contains("atexit"));
        assert!(PROFILE_RUNTIME_C.contains("\"calls\""));
    }
}
