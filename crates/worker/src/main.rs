use std::process::ExitCode;

use clap::Parser;

use mintforge_worker::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    mintforge_observability::init();

    let cli = Cli::parse();
    match mintforge_worker::runtime::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}
