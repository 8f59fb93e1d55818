//! Konpeito compiler library
//!
//! Compiles Ruby source (consumed as a concrete syntax tree from an
//! external parser front end) into a native shared library loadable by the
//! host interpreter as an extension module.
//!
//! The pipeline per compilation unit:
//!
//! ```text
//! LOAD_SIGNATURES -> BUILD_TYPED_AST -> INFER -> BUILD_HIR -> OPTIMIZE
//!   -> EMIT_IR -> EMIT_C_SHIM -> ASSEMBLE -> LINK -> DONE
//! ```
//!
//! Any fatal error terminates the compilation with a diagnostic;
//! intermediate artifacts are cleaned unless debug retention is requested.
//!
//! # Embedding
//!
//! ```rust,ignore
//! use konpeito::{compile_file_with_config, CompilerConfig};
//!
//! let config = CompilerConfig::new().with_rbs("sig/app.rbs");
//! compile_file_with_config("app.rb".as_ref(), "app.so".as_ref(), &config)?;
//! ```

pub mod config;
pub mod cst;
pub mod depgraph;
pub mod emit;
pub mod hir;
pub mod infer;
pub mod link;
pub mod opt;
pub mod shim;
pub mod sig;
pub mod tast;
pub mod types;

pub use config::{CompilerConfig, OptimizationLevel, Target};
pub use depgraph::DepGraph;
pub use sig::SignatureRegistry;
pub use types::Type;

use std::path::Path;
use std::process::Command;

/// Pipeline stages, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadSignatures,
    BuildTypedAst,
    Infer,
    BuildHir,
    Optimize,
    EmitIr,
    EmitCShim,
    Assemble,
    Link,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::LoadSignatures => "LOAD_SIGNATURES",
            Stage::BuildTypedAst => "BUILD_TYPED_AST",
            Stage::Infer => "INFER",
            Stage::BuildHir => "BUILD_HIR",
            Stage::Optimize => "OPTIMIZE",
            Stage::EmitIr => "EMIT_IR",
            Stage::EmitCShim => "EMIT_C_SHIM",
            Stage::Assemble => "ASSEMBLE",
            Stage::Link => "LINK",
            Stage::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

fn at(stage: Stage, e: String) -> String {
    format!("[{}] {}", stage, e)
}

/// The front half of the pipeline: signatures through optimized HIR. Used
/// by `build`, `check`, and the tests.
pub struct FrontArtifacts {
    pub registry: SignatureRegistry,
    pub program: hir::Program,
    /// Parameters that degraded to untyped during inference
    pub untyped_params: usize,
}

/// Run the front half over an already-parsed tree.
pub fn front_from_cst(
    root: &cst::Root,
    registry: SignatureRegistry,
) -> Result<FrontArtifacts, String> {
    tracing::debug!(stage = %Stage::BuildTypedAst, "building typed AST");
    let mut tprogram =
        tast::build::build(root, &registry).map_err(|e| at(Stage::BuildTypedAst, e))?;

    tracing::debug!(stage = %Stage::Infer, "running type inference");
    let untyped_params = infer::run(&mut tprogram).map_err(|e| at(Stage::Infer, e))?;
    if untyped_params > 0 {
        tracing::warn!(
            count = untyped_params,
            "parameters without declared or inferable types fall back to boxed dispatch"
        );
    }

    tracing::debug!(stage = %Stage::BuildHir, "lowering to HIR");
    let mut program = hir::lower::lower(&tprogram).map_err(|e| at(Stage::BuildHir, e))?;
    hir::validate::validate(&program).map_err(|e| at(Stage::BuildHir, e))?;

    tracing::debug!(stage = %Stage::Optimize, "running optimization passes");
    opt::run(&mut program).map_err(|e| at(Stage::Optimize, e))?;

    Ok(FrontArtifacts { registry, program, untyped_params })
}

/// Load every signature document named by the configuration.
pub fn load_signatures(config: &CompilerConfig) -> Result<SignatureRegistry, String> {
    tracing::debug!(stage = %Stage::LoadSignatures, "loading signature documents");
    let mut registry = SignatureRegistry::new();
    for path in &config.rbs_paths {
        let content = std::fs::read_to_string(path).map_err(|e| {
            at(
                Stage::LoadSignatures,
                format!("Failed to read '{}': {}", path.display(), e),
            )
        })?;
        registry
            .load_document(&content, &path.display().to_string())
            .map_err(|e| at(Stage::LoadSignatures, e))?;
    }
    registry.finalize().map_err(|e| at(Stage::LoadSignatures, e))?;
    Ok(registry)
}

/// Obtain the CST by running the external parser front end on a source
/// file. The parser prints the tree as JSON on stdout.
pub fn parse_source(input: &Path, config: &CompilerConfig) -> Result<cst::Root, String> {
    let mut parts = config.parser_cmd.split_whitespace();
    let cmd = parts
        .next()
        .ok_or_else(|| "empty parser command".to_string())?;
    let output = Command::new(cmd)
        .args(parts)
        .arg(input)
        .output()
        .map_err(|e| {
            format!(
                "Failed to run the parser front end '{}': {}.\n\
                 Set `parser_cmd` in konpeito.toml or pass --parser-cmd.",
                config.parser_cmd, e
            )
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("Parser front end failed:\n{}", stderr));
    }
    let json = String::from_utf8_lossy(&output.stdout);
    cst::Root::from_json(&json)
}

/// Module name exported by the shared library: `Init_<module_name>` is the
/// entry point the host looks up, derived from the output file stem.
pub fn module_name_for(output: &Path) -> String {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "konpeito_out".to_string());
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        name.insert(0, '_');
    }
    name
}

/// Compile one source file to a shared library.
pub fn compile_file_with_config(
    input: &Path,
    output: &Path,
    config: &CompilerConfig,
) -> Result<(), String> {
    if config.target == Target::Jvm {
        return Err(
            "the JVM back-end is not available in this build; use --target cruby".to_string(),
        );
    }

    let registry = load_signatures(config)?;
    let root = parse_source(input, config)?;
    let front = front_from_cst(&root, registry)?;
    let module_name = module_name_for(output);

    tracing::debug!(stage = %Stage::EmitIr, "emitting LLVM IR");
    let ir = emit::emit(
        &front.program,
        &front.registry,
        &emit::EmitOptions {
            profile: config.profile,
            module_name: module_name.clone(),
        },
    )
    .map_err(|e| at(Stage::EmitIr, e))?;

    tracing::debug!(stage = %Stage::EmitCShim, "generating C shim");
    let shim_c = shim::generate(&front.program, &front.registry, &module_name, config.profile)
        .map_err(|e| at(Stage::EmitCShim, e))?;

    tracing::debug!(stage = %Stage::Assemble, "assembling and linking");
    let ffi_libs: Vec<String> = front.registry.ffi_libraries().into_iter().collect();
    link::assemble_and_link(&ir, &shim_c, output, config, &ffi_libs)
        .map_err(|e| at(Stage::Link, e))?;

    tracing::debug!(stage = %Stage::Done, "compilation finished");

    if config.run_after_build {
        run_built_library(output)?;
    }
    Ok(())
}

/// Load the built extension in the host interpreter (`--run`): requiring
/// the library runs the compiled top-level code.
fn run_built_library(output: &Path) -> Result<(), String> {
    let abs = output
        .canonicalize()
        .map_err(|e| format!("Failed to resolve '{}': {}", output.display(), e))?;
    let status = Command::new("ruby")
        .arg("-r")
        .arg(&abs)
        .arg("-e")
        .arg("")
        .status()
        .map_err(|e| format!("Failed to run the host interpreter: {}", e))?;
    if !status.success() {
        return Err(format!(
            "host interpreter exited with status {:?}",
            status.code()
        ));
    }
    Ok(())
}

/// Compile a CST (as JSON) plus signature documents straight to IR and
/// shim text. The unit-test surface of the whole pipeline.
pub fn compile_cst_to_ir(
    cst_json: &str,
    rbs_docs: &[&str],
    module_name: &str,
) -> Result<(String, String), String> {
    let mut registry = SignatureRegistry::new();
    for (i, doc) in rbs_docs.iter().enumerate() {
        registry.load_document(doc, &format!("doc{}.rbs", i))?;
    }
    registry.finalize()?;
    let root = cst::Root::from_json(cst_json)?;
    let front = front_from_cst(&root, registry)?;
    let ir = emit::emit(
        &front.program,
        &front.registry,
        &emit::EmitOptions { profile: false, module_name: module_name.to_string() },
    )?;
    let shim_c = shim::generate(&front.program, &front.registry, module_name, false)?;
    Ok((ir, shim_c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_sanitized() {
        assert_eq!(module_name_for(Path::new("out/physics.so")), "physics");
        assert_eq!(module_name_for(Path::new("my-lib.so")), "my_lib");
        assert_eq!(module_name_for(Path::new("3d.so")), "_3d");
    }

    #[test]
    fn test_jvm_target_is_rejected() {
        let mut config = CompilerConfig::default();
        config.target = Target::Jvm;
        let err = compile_file_with_config(
            Path::new("in.rb"),
            Path::new("out.so"),
            &config,
        )
        .unwrap_err();
        assert!(err.contains("JVM back-end"));
    }

    #[test]
    fn test_stage_display_names() {
        assert_eq!(format!("{}", Stage::LoadSignatures), "LOAD_SIGNATURES");
        assert_eq!(format!("{}", Stage::EmitCShim), "EMIT_C_SHIM");
    }

    #[test]
    fn test_compile_cst_to_ir_end_to_end() {
        let (ir, shim) = compile_cst_to_ir(
            r#"{"body": [
                 {"kind": "def", "name": "add_integers",
                  "params": {"list": [{"name": "a"}, {"name": "b"}]},
                  "body": [{"kind": "call", "receiver": {"kind": "lvar", "name": "a"},
                            "name": "+", "args": [{"kind": "lvar", "name": "b"}]}]},
                 {"kind": "call", "receiver": null, "name": "add_integers",
                  "args": [{"kind": "int", "value": 1}, {"kind": "int", "value": 2}]}]}"#,
            &[],
            "demo",
        )
        .unwrap();
        assert!(ir.contains("add i64"));
        assert!(shim.contains("void Init_demo(void)"));
        assert!(shim.contains("rb_define_global_function(\"add_integers\""));
    }

    #[test]
    fn test_compiling_twice_is_byte_identical() {
        let json = r#"{"body": [
             {"kind": "def", "name": "f", "params": {"list": [{"name": "x"}]},
              "body": [{"kind": "if",
                        "cond": {"kind": "lvar", "name": "x"},
                        "then_body": [{"kind": "str", "value": "yes"}],
                        "else_body": [{"kind": "str", "value": "no"}]}]}]}"#;
        let (ir1, shim1) = compile_cst_to_ir(json, &[], "m").unwrap();
        let (ir2, shim2) = compile_cst_to_ir(json, &[], "m").unwrap();
        assert_eq!(ir1, ir2);
        assert_eq!(shim1, shim2);
    }

    #[test]
    fn test_signature_error_carries_stage() {
        let mut config = CompilerConfig::default();
        config.rbs_paths.push("definitely/not/here.rbs".into());
        let err = load_signatures(&config).unwrap_err();
        assert!(err.contains("[LOAD_SIGNATURES]"), "{}", err);
    }
}
