//! Tool, credential and input checks run before any side effect.

use serde::Deserialize;
use tracing::info;

use loadstack_common::handles::ACCOUNT_ID;
use loadstack_common::process::Termination;
use loadstack_common::{Error, HandleRegistry, Invocation, Result};

use crate::context::Context;

const TERRAFORM: (&str, &str) = (
    "terraform",
    "Install Terraform: https://developer.hashicorp.com/terraform/install",
);
const AWS: (&str, &str) = (
    "aws",
    "Install the AWS CLI: https://docs.aws.amazon.com/cli/latest/userguide/getting-started-install.html",
);
const KUBECTL: (&str, &str) = (
    "kubectl",
    "Install kubectl: https://kubernetes.io/docs/tasks/tools/",
);
const DOCKER: (&str, &str) = (
    "docker",
    "Install Docker: https://docs.docker.com/get-docker/",
);

/// What the validated run is about to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Full forward pipeline
    Deploy,
    /// Plan only
    Plan,
    /// Teardown
    Teardown,
}

impl Purpose {
    fn tools(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Purpose::Deploy => &[TERRAFORM, AWS, KUBECTL, DOCKER],
            Purpose::Plan => &[TERRAFORM, AWS],
            Purpose::Teardown => &[TERRAFORM, AWS, KUBECTL],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: Option<String>,
    arn: Option<String>,
}

/// Checks everything a run needs before it touches anything.
pub struct PrerequisiteValidator<'a> {
    ctx: &'a Context,
}

impl<'a> PrerequisiteValidator<'a> {
    /// Create a validator for `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Run every check for `purpose`, binding `account_id` on success.
    pub async fn validate(&self, purpose: Purpose, handles: &mut HandleRegistry) -> Result<()> {
        info!("Checking prerequisites...");
        self.check_tools(purpose.tools()).await?;
        self.check_inputs(purpose)?;

        let account = self.caller_identity().await?;
        handles.bind(ACCOUNT_ID, &account, "validate")?;

        if purpose == Purpose::Deploy {
            self.check_docker_daemon().await?;
        }
        Ok(())
    }

    async fn check_tools(&self, tools: &[(&str, &str)]) -> Result<()> {
        let mut missing = Vec::new();
        for (tool, hint) in tools {
            if !self.check_tool(tool).await? {
                missing.push((*tool, *hint));
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let what = missing
            .iter()
            .map(|(t, _)| *t)
            .collect::<Vec<_>>()
            .join(", ");
        let hint = missing
            .iter()
            .map(|(_, h)| *h)
            .collect::<Vec<_>>()
            .join(" ");
        Err(Error::prerequisite(format!("{} not found", what), hint))
    }

    async fn check_tool(&self, tool: &str) -> Result<bool> {
        let inv = Invocation::new("which").arg(tool);
        let out = match self.ctx.run(&inv).await {
            Ok(out) => out,
            Err(Error::Spawn { .. }) => {
                return Err(Error::prerequisite(
                    "which",
                    "Install it (debianutils or which package) so tools can be located.",
                ))
            }
            Err(e) => return Err(e),
        };
        match out.termination {
            Termination::Exited(0) => Ok(true),
            Termination::Cancelled => Err(Error::cancelled("prerequisite checks")),
            _ => Ok(false),
        }
    }

    fn check_inputs(&self, purpose: Purpose) -> Result<()> {
        let config = &self.ctx.config;
        let var_file = config.var_file();
        if !var_file.is_file() {
            return Err(Error::prerequisite(
                format!("parameter file {}", var_file.display()),
                format!(
                    "Create it or point terraform.var_file at the {} parameters.",
                    self.ctx.environment
                ),
            ));
        }
        if purpose != Purpose::Deploy {
            return Ok(());
        }
        if !config.workload.manifests_dir.is_dir() {
            return Err(Error::prerequisite(
                format!("manifest directory {}", config.workload.manifests_dir.display()),
                "Set workload.manifests_dir to the directory holding the Locust manifests.",
            ));
        }
        if !config.image.dockerfile.is_file() {
            return Err(Error::prerequisite(
                format!("Dockerfile {}", config.image.dockerfile.display()),
                "Set image.dockerfile to the Locust image Dockerfile.",
            ));
        }
        Ok(())
    }

    async fn caller_identity(&self) -> Result<String> {
        let inv = self
            .ctx
            .aws()
            .args(["sts", "get-caller-identity", "--output", "json"]);
        let out = self.ctx.run(&inv).await?;
        match out.termination {
            Termination::Exited(0) => {}
            Termination::Cancelled => return Err(Error::cancelled("credential check")),
            _ => {
                return Err(Error::prerequisite(
                    format!("AWS credentials ({})", out.error_tail()),
                    "Run `aws configure` or `aws sso login`, or export AWS_PROFILE.",
                ))
            }
        }

        let identity: CallerIdentity = serde_json::from_str(&out.stdout).map_err(|e| {
            Error::contract_violation(
                "aws sts get-caller-identity",
                format!("unparseable output: {}", e),
            )
        })?;
        let account = identity.account.filter(|a| !a.is_empty()).ok_or_else(|| {
            Error::contract_violation("aws sts get-caller-identity", "no Account in output")
        })?;
        info!(
            account = %account,
            arn = %identity.arn.unwrap_or_default(),
            "AWS credentials valid"
        );
        Ok(account)
    }

    async fn check_docker_daemon(&self) -> Result<()> {
        let inv = Invocation::new("docker").args(["info", "--format", "{{.ServerVersion}}"]);
        let out = self.ctx.run(&inv).await?;
        match out.termination {
            Termination::Exited(0) => Ok(()),
            Termination::Cancelled => Err(Error::cancelled("prerequisite checks")),
            _ => Err(Error::prerequisite(
                "a running Docker daemon",
                "Start Docker (or Docker Desktop) and retry.",
            )),
        }
    }
}
