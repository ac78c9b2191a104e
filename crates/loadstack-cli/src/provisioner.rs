//! Infrastructure provisioning through Terraform with remote, locked state.
//!
//! Every state-touching command passes `-lock=true -lock-timeout=<n>s`. Apply
//! and destroy are never retried automatically: a failure is reported and the
//! operator re-runs, relying on Terraform state to converge.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use loadstack_common::process::Termination;
use loadstack_common::{Error, HandleRegistry, Invocation, ProcessOutput, Result};

use crate::context::Context;

const LOCK_ERROR_MARKERS: [&str; 2] = ["Error acquiring the state lock", "Error locking state"];

/// Action Terraform plans for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlannedAction {
    /// New resource
    Create,
    /// In-place update
    Update,
    /// Removal
    Delete,
    /// Destroy and re-create
    Replace,
}

/// One resource with a planned change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedChange {
    /// Resource address (`module.eks.aws_eks_cluster.this`)
    pub address: String,
    /// Planned action
    pub action: PlannedAction,
}

/// Result of `terraform plan`, as read back from the saved plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    /// Saved plan file
    pub plan_file: PathBuf,
    /// Machine-readable plan written for review
    pub plan_json: PathBuf,
    /// Whether plan reported any change (exit code 2)
    pub has_changes: bool,
    /// Resources to create
    pub create: usize,
    /// Resources to update in place
    pub update: usize,
    /// Resources to delete
    pub delete: usize,
    /// Resources to replace
    pub replace: usize,
    /// Per-resource actions
    pub resources: Vec<PlannedChange>,
}

impl ChangeSummary {
    /// `Plan: 3 to add, 1 to change, 0 to destroy, 0 to replace`
    pub fn headline(&self) -> String {
        format!(
            "{} to add, {} to change, {} to destroy, {} to replace",
            self.create, self.update, self.delete, self.replace
        )
    }
}

#[derive(Debug, Deserialize)]
struct ShowPlan {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
}

#[derive(Debug, Deserialize)]
struct ResourceChange {
    address: String,
    change: Change,
}

#[derive(Debug, Deserialize)]
struct Change {
    actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OutputValue {
    value: serde_json::Value,
}

fn parse_change_summary(
    json: &str,
    plan_file: PathBuf,
    plan_json: PathBuf,
    has_changes: bool,
) -> Result<ChangeSummary> {
    let plan: ShowPlan = serde_json::from_str(json).map_err(|e| {
        Error::contract_violation("terraform show", format!("unparseable plan JSON: {}", e))
    })?;

    let mut summary = ChangeSummary {
        plan_file,
        plan_json,
        has_changes,
        create: 0,
        update: 0,
        delete: 0,
        replace: 0,
        resources: Vec::new(),
    };

    for rc in plan.resource_changes {
        let actions: Vec<&str> = rc.change.actions.iter().map(String::as_str).collect();
        let action = match actions.as_slice() {
            ["create"] => PlannedAction::Create,
            ["update"] => PlannedAction::Update,
            ["delete"] => PlannedAction::Delete,
            ["delete", "create"] | ["create", "delete"] => PlannedAction::Replace,
            _ => continue,
        };
        match action {
            PlannedAction::Create => summary.create += 1,
            PlannedAction::Update => summary.update += 1,
            PlannedAction::Delete => summary.delete += 1,
            PlannedAction::Replace => summary.replace += 1,
        }
        summary.resources.push(PlannedChange {
            address: rc.address,
            action,
        });
    }
    Ok(summary)
}

/// Lock ID from Terraform's "Lock Info" block
fn parse_lock_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("ID:"))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// Drives Terraform for one environment
pub struct Provisioner<'a> {
    ctx: &'a Context,
}

impl<'a> Provisioner<'a> {
    /// Create a provisioner for `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn terraform(&self) -> Invocation {
        Invocation::new("terraform")
            .current_dir(self.ctx.config.terraform.dir.clone())
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
    }

    fn lock_args(&self) -> [String; 2] {
        [
            "-lock=true".to_string(),
            format!("-lock-timeout={}s", self.ctx.config.terraform.lock_timeout_secs),
        ]
    }

    fn var_file_arg(&self) -> String {
        format!("-var-file={}", self.ctx.config.var_file().display())
    }

    /// Map a failed state-touching command to lock contention or a provisioning error.
    fn classify_failure(&self, operation: &str, inv: &Invocation, out: ProcessOutput) -> Error {
        match out.termination {
            Termination::Cancelled => return Error::cancelled(format!("terraform {}", operation)),
            Termination::TimedOut => {
                return Error::CommandTimedOut {
                    command: inv.display(),
                    deadline: inv.deadline_duration().unwrap_or_default(),
                }
            }
            _ => {}
        }
        let combined = out.combined();
        if LOCK_ERROR_MARKERS.iter().any(|m| combined.contains(m)) {
            return Error::LockContention {
                environment: self.ctx.environment.clone(),
                lock_id: parse_lock_id(&combined),
                detail: out.error_tail(),
            };
        }
        Error::provisioning(operation, out.error_tail())
    }

    /// `terraform init` with the backend settings for this environment
    pub async fn init(&self) -> Result<()> {
        info!("Initializing Terraform...");
        let mut inv = self
            .terraform()
            .args(["init", "-input=false", "-no-color", "-reconfigure"]);
        if let Some(backend) = &self.ctx.config.terraform.backend {
            let region = backend.region.clone().unwrap_or_else(|| self.ctx.region.clone());
            inv = inv.args([
                format!("-backend-config=bucket={}", backend.bucket),
                format!("-backend-config=key={}", backend.state_key(&self.ctx.environment)),
                format!("-backend-config=region={}", region),
                format!("-backend-config=dynamodb_table={}", backend.dynamodb_table),
                "-backend-config=encrypt=true".to_string(),
            ]);
        }
        let out = self.ctx.run(&inv).await?;
        if !out.success() {
            return Err(self.classify_failure("init", &inv, out));
        }
        Ok(())
    }

    /// `terraform validate`
    pub async fn validate(&self) -> Result<()> {
        let inv = self.terraform().args(["validate", "-no-color"]);
        let out = self.ctx.run(&inv).await?;
        match out.termination {
            Termination::Exited(0) => Ok(()),
            Termination::Cancelled => Err(Error::cancelled("terraform validate")),
            _ => Err(Error::configuration(format!(
                "terraform module is invalid: {}",
                out.error_tail()
            ))),
        }
    }

    /// `terraform plan` into the run workspace, then `terraform show -json` on it.
    pub async fn plan(&self) -> Result<ChangeSummary> {
        info!("Planning infrastructure changes...");
        let plan_file = self.ctx.workspace.plan_file();
        let inv = self
            .terraform()
            .args(["plan", "-input=false", "-no-color", "-detailed-exitcode"])
            .args(self.lock_args())
            .arg(self.var_file_arg())
            .arg(format!("-out={}", plan_file.display()))
            .streamed();

        let out = self.ctx.run(&inv).await?;
        let has_changes = match out.termination {
            Termination::Exited(0) => false,
            Termination::Exited(2) => true,
            _ => return Err(self.classify_failure("plan", &inv, out)),
        };

        let show = self
            .terraform()
            .args(["show", "-json", "-no-color"])
            .arg(plan_file.display().to_string());
        let shown = self.ctx.run(&show).await?;
        if !shown.success() {
            return Err(self.classify_failure("show", &show, shown));
        }

        let plan_json = self.ctx.workspace.plan_json();
        std::fs::write(&plan_json, &shown.stdout)?;
        let summary = parse_change_summary(&shown.stdout, plan_file, plan_json, has_changes)?;
        info!(
            changes = has_changes,
            plan = %summary.plan_json.display(),
            "Plan: {}",
            summary.headline()
        );
        Ok(summary)
    }

    /// Apply a saved plan. A plan without changes is not applied.
    pub async fn apply(&self, summary: &ChangeSummary) -> Result<()> {
        if !summary.has_changes {
            info!("Infrastructure is up to date, nothing to apply");
            return Ok(());
        }
        info!("Applying infrastructure changes ({})...", summary.headline());
        let inv = self
            .terraform()
            .args(["apply", "-input=false", "-no-color"])
            .args(self.lock_args())
            .arg(summary.plan_file.display().to_string())
            .maybe_deadline(self.ctx.config.deadlines.apply())
            .streamed();
        let out = self.ctx.run(&inv).await?;
        if !out.success() {
            return Err(self.classify_failure("apply", &inv, out));
        }
        Ok(())
    }

    /// `terraform output -json` as output name → string value
    pub async fn outputs(&self) -> Result<BTreeMap<String, String>> {
        let inv = self.terraform().args(["output", "-json", "-no-color"]);
        let out = self.ctx.run(&inv).await?;
        if !out.success() {
            return Err(self.classify_failure("output", &inv, out));
        }
        if out.stdout.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let raw: BTreeMap<String, OutputValue> = serde_json::from_str(&out.stdout).map_err(|e| {
            Error::contract_violation("terraform output", format!("unparseable output JSON: {}", e))
        })?;
        Ok(raw
            .into_iter()
            .filter_map(|(name, v)| {
                let value = match v.value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => return None,
                    other => other.to_string(),
                };
                Some((name, value))
            })
            .collect())
    }

    /// Bind every configured output to its handle.
    ///
    /// With `required`, a missing or empty output is a contract violation.
    /// Without it (teardown re-entry), missing outputs are skipped.
    pub async fn bind_outputs(
        &self,
        handles: &mut HandleRegistry,
        source: &str,
        required: bool,
    ) -> Result<()> {
        let outputs = self.outputs().await?;
        debug!(count = outputs.len(), "Read terraform outputs");
        for (handle, output_name) in &self.ctx.config.terraform.outputs {
            match outputs.get(output_name).filter(|v| !v.trim().is_empty()) {
                Some(value) => handles.bind(handle, value, source)?,
                None if required => {
                    return Err(Error::contract_violation(
                        "terraform output",
                        format!(
                            "apply succeeded but output '{}' (handle '{}') is missing or empty",
                            output_name, handle
                        ),
                    ))
                }
                None => warn!(
                    output = %output_name,
                    handle = %handle,
                    "Terraform output not present"
                ),
            }
        }
        Ok(())
    }

    /// `terraform destroy`, lock-guarded and never retried
    pub async fn destroy(&self) -> Result<()> {
        info!("Destroying infrastructure...");
        let inv = self
            .terraform()
            .args(["destroy", "-input=false", "-no-color", "-auto-approve"])
            .args(self.lock_args())
            .arg(self.var_file_arg())
            .maybe_deadline(self.ctx.config.deadlines.destroy())
            .streamed();
        let out = self.ctx.run(&inv).await?;
        if !out.success() {
            return Err(self.classify_failure("destroy", &inv, out));
        }
        Ok(())
    }
}
