// mlc - ML compiler and secure runtime CLI.
//
// Usage:
//   mlc transpile <file.ml> [--output <dir>]   Compile to Python on disk
//   mlc run <file.ml> [--sandbox]              Compile and execute sandboxed
//   mlc analyze <file.ml>                      Print security diagnostics
//   mlc check <file.ml>                        Analyze + validate only

use clap::Parser;
use mlscript::cli::{execute, Cli};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MLC_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    std::process::exit(execute(cli));
}
