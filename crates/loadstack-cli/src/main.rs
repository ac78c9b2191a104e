//! loadstack CLI
//!
//! Deploys and tears down Locust load-testing environments on AWS.

use std::process::ExitCode;

use clap::Parser;

use loadstack_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {} ({})", e, e.class());
            ExitCode::from(e.exit_code())
        }
    }
}
