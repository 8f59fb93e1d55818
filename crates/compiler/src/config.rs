//! Compiler configuration
//!
//! Options come from the CLI and, optionally, a `konpeito.toml` project
//! file; CLI flags win. External projects embedding the compiler construct
//! a configuration directly with the builder methods.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Back-end selection. Only the CRuby target is available in this build;
/// the JVM target is recognized and rejected with a clear diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    Cruby,
    Jvm,
}

impl std::str::FromStr for Target {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cruby" => Ok(Target::Cruby),
            "jvm" => Ok(Target::Jvm),
            other => Err(format!("unknown target '{}' (expected cruby or jvm)", other)),
        }
    }
}

/// Optimization level forwarded to the LLVM optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationLevel {
    O0,
    O1,
    #[default]
    O2,
    O3,
}

impl OptimizationLevel {
    pub fn flag(self) -> &'static str {
        match self {
            OptimizationLevel::O0 => "-O0",
            OptimizationLevel::O1 => "-O1",
            OptimizationLevel::O2 => "-O2",
            OptimizationLevel::O3 => "-O3",
        }
    }
}

/// Configuration for one compilation.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub target: Target,
    /// Signature documents loaded before type checking
    pub rbs_paths: Vec<PathBuf>,
    /// External parser front end; prints the CST as JSON on stdout
    pub parser_cmd: String,
    pub optimization_level: OptimizationLevel,
    /// Link the profile runtime and emit per-function counters
    pub profile: bool,
    /// Keep the .ll/.o/.c intermediates next to the output
    pub keep_intermediates: bool,
    /// Compile and link with debug info; on platforms with external debug
    /// bundles, also produce the companion bundle
    pub debug_symbols: bool,
    pub library_paths: Vec<String>,
    pub libraries: Vec<String>,
    /// JVM-target classpath; carried for CLI fidelity
    pub classpath: Option<String>,
    /// Load the built library in the host interpreter after linking
    pub run_after_build: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target: Target::Cruby,
            rbs_paths: Vec::new(),
            parser_cmd: "konpeito-parse".to_string(),
            optimization_level: OptimizationLevel::default(),
            profile: false,
            keep_intermediates: false,
            debug_symbols: false,
            library_paths: Vec::new(),
            libraries: Vec::new(),
            classpath: None,
            run_after_build: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_rbs(mut self, path: impl Into<PathBuf>) -> Self {
        self.rbs_paths.push(path.into());
        self
    }

    pub fn with_library(mut self, lib: impl Into<String>) -> Self {
        self.libraries.push(lib.into());
        self
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn with_parser_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.parser_cmd = cmd.into();
        self
    }

    /// Merge settings from a `konpeito.toml` project file underneath the
    /// current (CLI-derived) values: only unset/default fields take the
    /// project values.
    pub fn merge_project_file(&mut self, path: &Path) -> Result<(), String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read project file '{}': {}", path.display(), e))?;
        let project: ProjectFile = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse '{}': {}", path.display(), e))?;
        if self.parser_cmd == CompilerConfig::default().parser_cmd {
            if let Some(cmd) = project.parser_cmd {
                self.parser_cmd = cmd;
            }
        }
        for rbs in project.rbs.unwrap_or_default() {
            let p = PathBuf::from(rbs);
            if !self.rbs_paths.contains(&p) {
                self.rbs_paths.push(p);
            }
        }
        for lib in project.libraries.unwrap_or_default() {
            if !self.libraries.contains(&lib) {
                self.libraries.push(lib);
            }
        }
        for lp in project.library_paths.unwrap_or_default() {
            if !self.library_paths.contains(&lp) {
                self.library_paths.push(lp);
            }
        }
        Ok(())
    }
}

/// On-disk shape of `konpeito.toml`.
#[derive(Debug, Deserialize)]
struct ProjectFile {
    parser_cmd: Option<String>,
    rbs: Option<Vec<String>>,
    libraries: Option<Vec<String>>,
    library_paths: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CompilerConfig::default();
        assert_eq!(cfg.target, Target::Cruby);
        assert_eq!(cfg.optimization_level, OptimizationLevel::O2);
        assert_eq!(cfg.parser_cmd, "konpeito-parse");
        assert!(!cfg.profile);
    }

    #[test]
    fn test_target_parse() {
        assert_eq!("cruby".parse::<Target>().unwrap(), Target::Cruby);
        assert_eq!("jvm".parse::<Target>().unwrap(), Target::Jvm);
        assert!("wasm".parse::<Target>().is_err());
    }

    #[test]
    fn test_builder() {
        let cfg = CompilerConfig::new()
            .with_rbs("sig/app.rbs")
            .with_library("m")
            .with_library_path("/opt/lib");
        assert_eq!(cfg.rbs_paths.len(), 1);
        assert_eq!(cfg.libraries, vec!["m"]);
        assert_eq!(cfg.library_paths, vec!["/opt/lib"]);
    }

    #[test]
    fn test_project_file_merges_under_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("konpeito.toml");
        std::fs::write(
            &path,
            "parser_cmd = \"my-parse\"\nrbs = [\"sig/a.rbs\"]\nlibraries = [\"m\"]\n",
        )
        .unwrap();

        let mut cfg = CompilerConfig::new();
        cfg.merge_project_file(&path).unwrap();
        assert_eq!(cfg.parser_cmd, "my-parse");
        assert_eq!(cfg.rbs_paths, vec![PathBuf::from("sig/a.rbs")]);

        // CLI-set parser command wins over the project file
        let mut cfg = CompilerConfig::new().with_parser_cmd("cli-parse");
        cfg.merge_project_file(&path).unwrap();
        assert_eq!(cfg.parser_cmd, "cli-parse");
    }
}
