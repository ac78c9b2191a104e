//! loadstack: deploy and tear down a Locust load-testing stack on AWS
//!
//! Drives `terraform`, `aws`, `kubectl` and `docker` through an ordered phase
//! pipeline (validate, provision, configureAccess, publish, deploy) and a
//! dependency-ordered teardown sequencer.

pub mod access;
pub mod commands;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod prerequisites;
pub mod provisioner;
pub mod publisher;
pub mod report;
pub mod teardown;
pub mod workload;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use loadstack_common::{Error, Result};

use clap::{Parser, Subcommand};

/// loadstack - Locust load-testing environments on AWS
#[derive(Parser, Debug)]
#[command(name = "loadstack")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: commands::GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision infrastructure, publish the image and deploy Locust
    Deploy(commands::deploy::DeployArgs),
    /// Validate and plan infrastructure changes without applying them
    Plan(commands::plan::PlanArgs),
    /// Tear the environment down (asks for confirmation)
    Teardown(commands::teardown::TeardownArgs),
}

impl Cli {
    /// Run the CLI command, returning the process exit code
    pub async fn run(self) -> Result<u8> {
        match self.command {
            Commands::Deploy(args) => commands::deploy::run(&self.global, args).await,
            Commands::Plan(args) => commands::plan::run(&self.global, args).await,
            Commands::Teardown(args) => commands::teardown::run(&self.global, args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "loadstack",
            "deploy",
            "dev",
            "abc123",
            "--region",
            "eu-west-1",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.global.region.as_deref(), Some("eu-west-1"));
        assert_eq!(cli.global.log_format, commands::LogFormat::Json);
        match cli.command {
            Commands::Deploy(args) => {
                assert_eq!(args.environment, "dev");
                assert_eq!(args.image_tag, "abc123");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn teardown_accepts_yes() {
        let cli = Cli::try_parse_from(["loadstack", "teardown", "dev", "--yes"]).unwrap();
        match cli.command {
            Commands::Teardown(args) => assert!(args.yes),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
