//! State shared by every component of one run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use loadstack_common::{Invocation, ProcessOutput, ProcessRunner, Result};

use crate::config::EnvironmentConfig;
use crate::workspace::RunWorkspace;

/// Target, settings, workspace and the means to run tools
#[derive(Clone)]
pub struct Context {
    /// Target environment
    pub environment: String,
    /// Cloud region
    pub region: String,
    /// Environment settings
    pub config: Arc<EnvironmentConfig>,
    /// Per-run directory
    pub workspace: RunWorkspace,
    /// Runs external tools
    pub runner: Arc<dyn ProcessRunner>,
    /// Fired on operator interrupt
    pub cancel: CancellationToken,
}

impl Context {
    /// Run `invocation` and return its output whatever the exit status.
    pub async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.runner.run(invocation, &self.cancel).await
    }

    /// Run `invocation`, turning any non-zero exit into an error.
    pub async fn run_checked(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.run(invocation).await?.check(invocation)
    }

    /// Base `kubectl` invocation bound to the run's kubeconfig
    pub fn kubectl(&self) -> Invocation {
        Invocation::new("kubectl").env(
            "KUBECONFIG",
            self.workspace.kubeconfig().display().to_string(),
        )
    }

    /// Base `aws` invocation pinned to the run's region
    pub fn aws(&self) -> Invocation {
        Invocation::new("aws")
            .env("AWS_REGION", self.region.clone())
            .env("AWS_PAGER", "")
    }
}
