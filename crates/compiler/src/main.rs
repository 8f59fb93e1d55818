//! Konpeito CLI
//!
//! Command-line driver for compiling Ruby source files into native
//! extension modules, running front-half checks, and inspecting the
//! incremental-build dependency graph.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use konpeito::{CompilerConfig, DepGraph, OptimizationLevel, Target};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "konpeito")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ruby ahead-of-time compiler - build native extension modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a Ruby file to a shared library
    Build {
        /// Input .rb source file
        input: PathBuf,

        /// Output shared library path (defaults to the input stem with the
        /// platform extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Compilation target
        #[arg(long, default_value = "cruby", value_parser = parse_target)]
        target: Target,

        /// JVM classpath (jvm target only)
        #[arg(long)]
        classpath: Option<String>,

        /// Signature file(s) to load
        #[arg(long = "rbs", value_name = "PATH")]
        rbs: Vec<PathBuf>,

        /// Load the built library in the host interpreter after linking
        #[arg(long)]
        run: bool,

        /// Link the profile runtime and write <module>_profile.json at exit
        #[arg(long)]
        profile: bool,

        /// Keep intermediate .ll/.o/.c files
        #[arg(long)]
        keep_ir: bool,

        /// Build with debug symbols (dSYM bundle / inline DWARF)
        #[arg(long)]
        debug: bool,

        /// Parser front end command (prints the CST as JSON)
        #[arg(long)]
        parser_cmd: Option<String>,

        /// Optimization level for the LLVM optimizer
        #[arg(short = 'O', default_value = "2", value_parser = parse_opt_level)]
        opt_level: OptimizationLevel,
    },

    /// Run the front half only: signatures, typing, inference, HIR checks
    Check {
        /// Input .rb source file
        input: PathBuf,

        /// Signature file(s) to load
        #[arg(long = "rbs", value_name = "PATH")]
        rbs: Vec<PathBuf>,

        /// Parser front end command
        #[arg(long)]
        parser_cmd: Option<String>,

        /// Print the optimized HIR
        #[arg(long)]
        dump_hir: bool,
    },

    /// Inspect a persisted dependency graph
    Deps {
        /// Path to the graph JSON document
        graph: PathBuf,

        /// Show only the entries for this file
        #[arg(long)]
        of: Option<String>,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_target(s: &str) -> Result<Target, String> {
    s.parse()
}

fn parse_opt_level(s: &str) -> Result<OptimizationLevel, String> {
    match s {
        "0" => Ok(OptimizationLevel::O0),
        "1" => Ok(OptimizationLevel::O1),
        "2" => Ok(OptimizationLevel::O2),
        "3" => Ok(OptimizationLevel::O3),
        other => Err(format!("invalid optimization level '{}'", other)),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            target,
            classpath,
            rbs,
            run,
            profile,
            keep_ir,
            debug,
            parser_cmd,
            opt_level,
        } => {
            let output = output.unwrap_or_else(|| {
                let stem = input.file_stem().unwrap_or_default();
                PathBuf::from(stem).with_extension(konpeito::link::shared_lib_extension())
            });
            let mut config = CompilerConfig::new();
            config.target = target;
            config.classpath = classpath;
            config.rbs_paths = rbs;
            config.run_after_build = run;
            config.profile = profile;
            config.keep_intermediates = keep_ir;
            config.debug_symbols = debug;
            config.optimization_level = opt_level;
            if let Some(cmd) = parser_cmd {
                config.parser_cmd = cmd;
            }
            merge_project_config(&mut config);

            match konpeito::compile_file_with_config(&input, &output, &config) {
                Ok(()) => {
                    println!("Compiled {} -> {}", input.display(), output.display());
                    if keep_ir {
                        println!("Intermediates kept next to {}", output.display());
                    }
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
        Commands::Check { input, rbs, parser_cmd, dump_hir } => {
            let mut config = CompilerConfig::new();
            config.rbs_paths = rbs;
            if let Some(cmd) = parser_cmd {
                config.parser_cmd = cmd;
            }
            merge_project_config(&mut config);
            run_check(&input, &config, dump_hir);
        }
        Commands::Deps { graph, of } => run_deps(&graph, of.as_deref()),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "konpeito", &mut io::stdout());
        }
    }
}

fn merge_project_config(config: &mut CompilerConfig) {
    let project = Path::new("konpeito.toml");
    if project.exists() {
        if let Err(e) = config.merge_project_file(project) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_check(input: &Path, config: &CompilerConfig, dump_hir: bool) {
    let result = konpeito::load_signatures(config)
        .and_then(|registry| {
            konpeito::parse_source(input, config).map(|root| (registry, root))
        })
        .and_then(|(registry, root)| konpeito::front_from_cst(&root, registry));
    match result {
        Ok(front) => {
            if dump_hir {
                print!("{}", konpeito::hir::pretty::program(&front.program));
            }
            let functions = front.program.functions.len();
            let classes = front.program.classes.len();
            println!(
                "{}: ok ({} functions, {} classes{})",
                input.display(),
                functions,
                classes,
                if front.untyped_params > 0 {
                    format!(", {} untyped parameters", front.untyped_params)
                } else {
                    String::new()
                }
            );
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run_deps(graph_path: &Path, of: Option<&str>) {
    match DepGraph::load(graph_path) {
        Ok(graph) => match of {
            Some(file) => {
                let deps = graph.dependencies_of(file);
                let dependents = graph.dependents_of(file);
                println!("{}:", file);
                println!(
                    "  depends on: {}",
                    deps.map(|s| s.iter().cloned().collect::<Vec<_>>().join(", "))
                        .unwrap_or_else(|| "-".to_string())
                );
                println!(
                    "  dependents: {}",
                    dependents
                        .map(|s| s.iter().cloned().collect::<Vec<_>>().join(", "))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            None => match graph.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            },
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
