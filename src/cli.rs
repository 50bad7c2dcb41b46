//! `mlc` command implementations.

use crate::capability::PolicyStore;
use crate::config::MlConfig;
use crate::diagnostics::{render_json, render_report, Severity};
use crate::sandbox::{SandboxConfig, SandboxSession};
use crate::{CompileFailure, CompileOptions, Pipeline};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_INFRASTRUCTURE: i32 = 1;
pub const EXIT_REJECTED: i32 = 2;

#[derive(Parser)]
#[command(name = "mlc")]
#[command(about = "ML compiler and secure runtime", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile an ML file to Python and write it to the output directory
    Transpile {
        /// Path to the .ml source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output directory (default: ./build)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Additional policy files to validate against
        #[arg(long, value_name = "FILE")]
        policy: Vec<PathBuf>,
    },

    /// Compile in memory and execute in the sandbox
    Run {
        /// Path to the .ml source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Apply the strict sandbox limit profile
        #[arg(long)]
        sandbox: bool,

        /// CPU time limit in seconds
        #[arg(long, value_name = "N")]
        cpu_time: Option<u64>,

        /// Memory limit in megabytes
        #[arg(long, value_name = "N")]
        memory_mb: Option<u64>,

        /// Deny network access
        #[arg(long)]
        no_network: bool,

        /// Additional policy files granting capabilities
        #[arg(long, value_name = "FILE")]
        policy: Vec<PathBuf>,
    },

    /// Print security diagnostics without generating code
    Analyze {
        /// Path to the .ml source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Parse, analyze, and validate without writing output
    Check {
        /// Path to the .ml source file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Additional policy files to validate against
        #[arg(long, value_name = "FILE")]
        policy: Vec<PathBuf>,
    },
}

struct Workspace {
    source: String,
    filename: String,
    config: MlConfig,
    pipeline: Pipeline,
}

fn open_workspace(input: &Path) -> Result<Workspace, i32> {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(err) => {
            error!(file = %input.display(), %err, "cannot read input");
            eprintln!("error: cannot read {}: {}", input.display(), err);
            return Err(EXIT_INFRASTRUCTURE);
        }
    };
    let config = MlConfig::discover(input)
        .map(|(_, config)| config)
        .unwrap_or_default();
    let options = CompileOptions {
        analysis: config.analysis_options(),
        principal: config.principal().to_string(),
    };
    Ok(Workspace {
        source,
        filename: input.display().to_string(),
        pipeline: Pipeline::new(options),
        config,
    })
}

fn load_policies(config: &MlConfig, extra: &[PathBuf], input: &Path) -> Result<PolicyStore, i32> {
    let base_dir = input.parent().unwrap_or(Path::new("."));
    let mut paths: Vec<PathBuf> = config
        .policy
        .files
        .iter()
        .map(|p| if p.is_absolute() { p.clone() } else { base_dir.join(p) })
        .collect();
    paths.extend(extra.iter().cloned());

    PolicyStore::load_files(&paths).map_err(|err| {
        eprintln!("error: {}", err);
        EXIT_INFRASTRUCTURE
    })
}

fn report_failure(failure: &CompileFailure, source: &str) -> i32 {
    match failure {
        CompileFailure::Parse(err) => {
            eprintln!("{}", err);
            EXIT_REJECTED
        }
        CompileFailure::Analysis(report) => {
            eprint!("{}", render_report(&report.diagnostics, Some(source)));
            eprintln!("error: security analysis rejected the program");
            EXIT_REJECTED
        }
        CompileFailure::Capability { error, report } => {
            if !report.diagnostics.is_empty() {
                eprint!("{}", render_report(&report.diagnostics, Some(source)));
            }
            eprintln!("error: {}", error);
            EXIT_REJECTED
        }
    }
}

pub fn execute(cli: Cli) -> i32 {
    match cli.command {
        Commands::Transpile {
            input,
            output,
            policy,
        } => transpile(&input, output, &policy),
        Commands::Run {
            input,
            sandbox,
            cpu_time,
            memory_mb,
            no_network,
            policy,
        } => run(&input, sandbox, cpu_time, memory_mb, no_network, &policy),
        Commands::Analyze { input, format } => analyze(&input, format),
        Commands::Check { input, policy } => check(&input, &policy),
    }
}

fn transpile(input: &Path, output: Option<PathBuf>, extra_policies: &[PathBuf]) -> i32 {
    let workspace = match open_workspace(input) {
        Ok(workspace) => workspace,
        Err(code) => return code,
    };
    let policies = match load_policies(&workspace.config, extra_policies, input) {
        Ok(policies) => policies,
        Err(code) => return code,
    };

    let compiled =
        match workspace
            .pipeline
            .compile(&workspace.source, &workspace.filename, &policies)
        {
            Ok(compiled) => compiled,
            Err(failure) => return report_failure(&failure, &workspace.source),
        };

    let output_dir = output.unwrap_or_else(|| PathBuf::from("build"));
    if let Err(err) = std::fs::create_dir_all(&output_dir) {
        eprintln!("error: cannot create {}: {}", output_dir.display(), err);
        return EXIT_INFRASTRUCTURE;
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "program".to_string());
    let program_path = output_dir.join(format!("{}.py", stem));
    let map_path = output_dir.join(format!("{}.py.map", stem));
    let runtime_path = output_dir.join(format!("{}.py", crate::codegen::RUNTIME_MODULE));

    let map_json = match compiled.source_map.to_json() {
        Ok(json) => json,
        Err(err) => {
            eprintln!("error: cannot serialize source map: {}", err);
            return EXIT_INFRASTRUCTURE;
        }
    };
    let writes = [
        (&program_path, compiled.python.as_str()),
        (&map_path, map_json.as_str()),
        (&runtime_path, crate::codegen::RUNTIME_PREAMBLE),
    ];
    for (path, contents) in writes {
        if let Err(err) = std::fs::write(path, contents) {
            eprintln!("error: cannot write {}: {}", path.display(), err);
            return EXIT_INFRASTRUCTURE;
        }
    }

    if !compiled.report.diagnostics.is_empty() {
        eprint!(
            "{}",
            render_report(&compiled.report.diagnostics, Some(&workspace.source))
        );
    }
    println!("wrote {}", program_path.display());
    EXIT_OK
}

fn run(
    input: &Path,
    strict: bool,
    cpu_time: Option<u64>,
    memory_mb: Option<u64>,
    no_network: bool,
    extra_policies: &[PathBuf],
) -> i32 {
    let workspace = match open_workspace(input) {
        Ok(workspace) => workspace,
        Err(code) => return code,
    };
    let policies = match load_policies(&workspace.config, extra_policies, input) {
        Ok(policies) => policies,
        Err(code) => return code,
    };

    let compiled =
        match workspace
            .pipeline
            .compile(&workspace.source, &workspace.filename, &policies)
        {
            Ok(compiled) => compiled,
            Err(failure) => return report_failure(&failure, &workspace.source),
        };

    let mut sandbox_config = workspace.config.sandbox_config();
    if !strict {
        // Development profile: generous limits unless the flags say
        // otherwise.
        sandbox_config.cpu_time_limit = Duration::from_secs(60);
        sandbox_config.wall_time_limit = Duration::from_secs(300);
        sandbox_config.network_allowed = true;
    }
    if let Some(seconds) = cpu_time {
        sandbox_config.cpu_time_limit = Duration::from_secs(seconds);
        sandbox_config.wall_time_limit = sandbox_config
            .wall_time_limit
            .max(Duration::from_secs(seconds * 2));
    }
    if let Some(mb) = memory_mb {
        sandbox_config.memory_limit_bytes = mb * 1024 * 1024;
    }
    if no_network {
        sandbox_config.network_allowed = false;
    }
    // Programs may read files next to their source through the capability
    // layer.
    if let Some(parent) = input.parent() {
        sandbox_config.filesystem_roots.push(parent.to_path_buf());
    }

    let result = match SandboxSession::execute(
        &compiled.python,
        &compiled.granted_tokens,
        sandbox_config,
    ) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("error: {}", err);
            return EXIT_INFRASTRUCTURE;
        }
    };

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if result.status != crate::sandbox::SandboxStatus::Completed {
        eprintln!(
            "sandbox: {} (cpu {:.2}s, wall {:.2}s, peak {} KiB)",
            result.status.as_str(),
            result.cpu_time.as_secs_f64(),
            result.wall_time.as_secs_f64(),
            result.peak_memory_bytes / 1024
        );
    }
    result.exit_code
}

fn analyze(input: &Path, format: OutputFormat) -> i32 {
    let workspace = match open_workspace(input) {
        Ok(workspace) => workspace,
        Err(code) => return code,
    };

    let program = match workspace
        .pipeline
        .parse(&workspace.source, &workspace.filename)
    {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{}", err.with_source_line(&workspace.source));
            return EXIT_REJECTED;
        }
    };

    let report = workspace.pipeline.analyze(&program, &workspace.filename);
    match format {
        OutputFormat::Text => {
            if report.diagnostics.is_empty() {
                println!("no findings");
            } else {
                print!(
                    "{}",
                    render_report(&report.diagnostics, Some(&workspace.source))
                );
            }
        }
        OutputFormat::Json => match render_json(&report.diagnostics) {
            Ok(json) => println!("{}", json),
            Err(err) => {
                eprintln!("error: {}", err);
                return EXIT_INFRASTRUCTURE;
            }
        },
    }

    if report.count_at_or_above(Severity::Medium) > 0 {
        EXIT_REJECTED
    } else {
        EXIT_OK
    }
}

fn check(input: &Path, extra_policies: &[PathBuf]) -> i32 {
    let workspace = match open_workspace(input) {
        Ok(workspace) => workspace,
        Err(code) => return code,
    };
    let policies = match load_policies(&workspace.config, extra_policies, input) {
        Ok(policies) => policies,
        Err(code) => return code,
    };

    match workspace
        .pipeline
        .compile(&workspace.source, &workspace.filename, &policies)
    {
        Ok(compiled) => {
            if !compiled.report.diagnostics.is_empty() {
                eprint!(
                    "{}",
                    render_report(&compiled.report.diagnostics, Some(&workspace.source))
                );
            }
            println!("ok");
            EXIT_OK
        }
        Err(failure) => report_failure(&failure, &workspace.source),
    }
}
