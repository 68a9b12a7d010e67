use std::process::ExitCode;

use clap::Parser;

use calbot_runtime::{dispatch_cli, exit_code_for, init_tracing, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match dispatch_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("calbot: {error:#}");
            exit_code_for(&error)
        }
    }
}
