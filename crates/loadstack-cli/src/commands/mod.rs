//! CLI commands

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loadstack_common::telemetry::{init_logging, LoggingConfig};
use loadstack_common::{Error, Result, SystemRunner};

use crate::config::{validate_environment_name, EnvironmentConfig};
use crate::context::Context;
use crate::report::write_json;
use crate::workspace::{generate_run_id, RunWorkspace};

pub mod deploy;
pub mod plan;
pub mod teardown;

/// Console log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Cloud region; overrides the environment config
    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Directory holding `<environment>.yaml`
    #[arg(long, global = true, default_value = "config")]
    pub config_dir: PathBuf,

    /// Directory for per-run workspaces
    #[arg(long, global = true, default_value = ".loadstack")]
    pub state_dir: PathBuf,

    /// Console log format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// `--region`/`AWS_REGION` first, then the environment config.
pub(crate) fn resolve_region(flag: Option<&str>, config: &EnvironmentConfig) -> Result<String> {
    flag.filter(|r| !r.trim().is_empty())
        .map(str::to_string)
        .or_else(|| config.region.clone())
        .ok_or_else(|| {
            Error::configuration(
                "no region: pass --region, set AWS_REGION or set region in the environment config",
            )
        })
}

/// Load settings, create the run workspace, start logging and wire Ctrl-C.
pub(crate) fn prepare(global: &GlobalArgs, environment: &str) -> Result<Context> {
    validate_environment_name(environment)?;
    let config = EnvironmentConfig::load(&global.config_dir, environment)?;
    let region = resolve_region(global.region.as_deref(), &config)?;
    let workspace = RunWorkspace::create(&global.state_dir, environment, &generate_run_id())?;

    init_logging(LoggingConfig {
        log_file: Some(workspace.log_path()),
        json_console: global.log_format == LogFormat::Json,
    })
    .map_err(|e| Error::internal("logging", e.to_string()))?;

    info!(
        environment = %environment,
        region = %region,
        run_id = %workspace.run_id(),
        workspace = %workspace.root().display(),
        "Starting run"
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    Ok(Context {
        environment: environment.to_string(),
        region,
        config: Arc::new(config),
        workspace,
        runner: Arc::new(SystemRunner::new()),
        cancel,
    })
}

/// Print the summary, write `report.json` and hand back the exit code.
pub(crate) fn finish<T: Serialize>(ctx: &Context, report: &T, summary: &str, exit_code: u8) -> u8 {
    println!("{}", summary);
    let path = ctx.workspace.report_json();
    if let Err(e) = write_json(&path, report) {
        warn!(path = %path.display(), error = %e, "Could not write run report");
    }
    println!("Run log: {}", ctx.workspace.log_path().display());
    exit_code
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after cleanup of running commands...");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_region_wins_over_config() {
        let config = EnvironmentConfig {
            region: Some("eu-west-1".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_region(Some("us-east-2"), &config).unwrap(), "us-east-2");
        assert_eq!(resolve_region(None, &config).unwrap(), "eu-west-1");
        assert_eq!(resolve_region(Some(" "), &config).unwrap(), "eu-west-1");
    }

    #[test]
    fn missing_region_is_configuration_error() {
        let err = resolve_region(None, &EnvironmentConfig::default()).unwrap_err();
        assert_eq!(err.class(), loadstack_common::ErrorClass::Configuration);
    }
}
