mod cli;

use std::process::ExitCode;

use clap::Parser;
use tracing::debug;

fn main() -> ExitCode {
    let cli_args = cli::Cli::parse();

    // Only log when asked to; stdout carries the command output
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }
    debug!(socket = %cli_args.socket.display(), "thermctl starting");

    match cli::run_cli(&cli_args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
