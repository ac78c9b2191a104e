//! Run summaries: terminal output, `report.json` and next-step suggestions.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use loadstack_common::session::{PhaseStatus, Warning};
use loadstack_common::{Error, ErrorClass, HandleRegistry, Result};

use crate::context::Context;
use crate::pipeline::PipelineReport;
use crate::teardown::{StepOutcome, TeardownReport};

/// The fatal error that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// Phase or teardown step that failed
    pub phase: String,
    /// Error class
    pub class: ErrorClass,
    /// Error message
    pub message: String,
    /// Command the operator should run next
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_command: Option<String>,
}

impl Failure {
    /// Summarise `error` raised by `phase`
    pub fn new(phase: &str, error: &Error, next_command: Option<String>) -> Self {
        Self {
            phase: phase.to_string(),
            class: error.class(),
            message: error.to_string(),
            next_command,
        }
    }
}

/// Suggests what to run after a failure
pub struct NextCommand<'a> {
    ctx: &'a Context,
    rerun: String,
}

impl<'a> NextCommand<'a> {
    /// `rerun` is the command that repeats the failed run
    pub fn new(ctx: &'a Context, rerun: impl Into<String>) -> Self {
        Self {
            ctx,
            rerun: rerun.into(),
        }
    }

    fn terraform(&self, args: &str) -> String {
        format!(
            "terraform -chdir={} {}",
            self.ctx.config.terraform.dir.display(),
            args
        )
    }

    /// Command for `error`, if there is a useful one
    pub fn for_error(&self, error: &Error) -> Option<String> {
        match error {
            Error::LockContention { lock_id, .. } => Some(self.terraform(&format!(
                "force-unlock {}",
                lock_id.as_deref().unwrap_or("<LOCK_ID>")
            ))),
            Error::ReadinessTimeout { .. } => Some(format!(
                "KUBECONFIG={} kubectl get nodes -o wide",
                self.ctx.workspace.kubeconfig().display()
            )),
            Error::ContractViolation { source_name, .. }
                if source_name.starts_with("terraform") =>
            {
                Some(self.terraform("output"))
            }
            Error::Prerequisite { .. }
            | Error::Configuration { .. }
            | Error::Internal { .. }
            | Error::HandleRebind { .. } => None,
            _ => Some(self.rerun.clone()),
        }
    }
}

/// Write `value` as pretty JSON
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn status_label(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => "pending",
        PhaseStatus::Running => "running",
        PhaseStatus::Succeeded => "succeeded",
        PhaseStatus::Degraded => "degraded",
        PhaseStatus::Failed => "FAILED",
        PhaseStatus::Skipped => "skipped",
        PhaseStatus::Cancelled => "cancelled",
    }
}

fn outcome_label(outcome: &StepOutcome) -> String {
    match outcome {
        StepOutcome::Completed => "completed".to_string(),
        StepOutcome::Skipped { reason } => format!("skipped ({})", reason),
        StepOutcome::Overridden { reason } => format!("overridden ({})", reason),
        StepOutcome::Failed { class, .. } => format!("FAILED ({})", class),
    }
}

fn render_handles(out: &mut String, handles: &HandleRegistry) {
    if handles.is_empty() {
        return;
    }
    let _ = writeln!(out, "\nResources:");
    for (name, value) in handles.summary() {
        let _ = writeln!(out, "  {:<20} {}", name, value);
    }
}

fn render_warnings(out: &mut String, warnings: &[Warning]) {
    if warnings.is_empty() {
        return;
    }
    let _ = writeln!(out, "\nWarnings:");
    for w in warnings {
        let _ = writeln!(out, "  [{}] {}", w.source, w.message);
        if let Some(cmd) = &w.follow_up {
            let _ = writeln!(out, "      follow up: {}", cmd);
        }
    }
}

fn render_failure(out: &mut String, failure: &Option<Failure>) {
    let Some(f) = failure else { return };
    let _ = writeln!(out, "\nFailed in {}: {} ({})", f.phase, f.message, f.class);
    if let Some(cmd) = &f.next_command {
        let _ = writeln!(out, "Next: {}", cmd);
    }
}

/// Summary of a deploy or plan run
pub fn render_pipeline(report: &PipelineReport) -> String {
    let session = &report.session;
    let mut out = String::new();
    let _ = write!(out, "Environment {} ({})", session.environment, session.region);
    if let Some(tag) = &session.image_tag {
        let _ = write!(out, ", image tag {}", tag);
    }
    let _ = writeln!(out, ", run {}", session.run_id);

    for p in &session.phases {
        let _ = write!(out, "  {:<16} {}", p.name.as_str(), status_label(p.status));
        if let Some(ms) = p.elapsed_ms {
            let _ = write!(out, " in {:.1}s", ms as f64 / 1000.0);
        }
        let _ = writeln!(out);
    }

    if let Some(plan) = &report.change_summary {
        let _ = writeln!(out, "\nPlan: {}", plan.headline());
        let _ = writeln!(out, "  change plan: {}", plan.plan_json.display());
    }
    render_handles(&mut out, &session.handles);
    render_warnings(&mut out, &session.warnings);
    render_failure(&mut out, &report.failure);
    out
}

/// Summary of a teardown run
pub fn render_teardown(report: &TeardownReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Teardown of {}, run {}", report.environment, report.run_id);
    for s in &report.steps {
        let _ = writeln!(out, "  {:<32} {}", s.step.as_str(), outcome_label(&s.outcome));
    }
    let _ = writeln!(out, "  state: {}", report.state);
    render_warnings(&mut out, &report.warnings);
    render_failure(&mut out, &report.failure);
    out
}
