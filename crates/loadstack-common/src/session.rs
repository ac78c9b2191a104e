//! Deployment session and phase bookkeeping
//!
//! A [`DeploymentSession`] lives for one run. It is never persisted: a re-run
//! relies on the external systems' own state (remote Terraform state, the
//! registry, the cluster) to converge.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::handles::HandleRegistry;
use crate::{Error, ErrorClass, Result};

/// Forward pipeline phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseName {
    /// Tools, credentials and inputs
    Validate,
    /// Review-only infrastructure plan
    Plan,
    /// Infrastructure plan and apply
    Provision,
    /// Cluster credentials and node capacity
    ConfigureAccess,
    /// Image build and push
    Publish,
    /// Workload apply and readiness
    Deploy,
}

impl PhaseName {
    /// Phases of a full deploy run
    pub const FORWARD: [PhaseName; 5] = [
        PhaseName::Validate,
        PhaseName::Provision,
        PhaseName::ConfigureAccess,
        PhaseName::Publish,
        PhaseName::Deploy,
    ];

    /// Phases of a plan-only run
    pub const PLAN_ONLY: [PhaseName; 2] = [PhaseName::Validate, PhaseName::Plan];

    /// Name as shown in reports
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Validate => "validate",
            PhaseName::Plan => "plan",
            PhaseName::Provision => "provision",
            PhaseName::ConfigureAccess => "configureAccess",
            PhaseName::Publish => "publish",
            PhaseName::Deploy => "deploy",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase status. `Succeeded`, `Degraded`, `Failed`, `Skipped` and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseStatus {
    /// Not started
    Pending,
    /// In progress
    Running,
    /// Completed fully
    Succeeded,
    /// Completed with warnings (partial workload readiness)
    Degraded,
    /// Ended with a fatal error
    Failed,
    /// Never started because an earlier phase did not complete
    Skipped,
    /// Interrupted by the operator
    Cancelled,
}

impl PhaseStatus {
    /// Whether the status can no longer change
    pub fn is_terminal(self) -> bool {
        !matches!(self, PhaseStatus::Pending | PhaseStatus::Running)
    }

    fn can_become(self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Degraded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Degraded => "degraded",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a phase may have changed in the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SideEffect {
    /// Nothing external was touched
    None,
    /// Something may have been created; re-running converges
    Partial,
    /// The phase's changes are in place
    Committed,
}

/// Kind of non-fatal issue collected during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    /// Workload readiness fell short of its minimum
    DegradedReadiness,
    /// The UI load balancer did not get an address in time
    EndpointPending,
    /// Load-balancer network interfaces outlived their wait
    TeardownOrderingTimeout,
    /// A teardown step was skipped
    SkippedStep,
    /// Anything else worth surfacing
    Notice,
}

/// A non-fatal issue, printed in the summary without aborting the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    /// Kind of issue
    pub kind: WarningKind,
    /// Phase or step that raised it
    pub source: String,
    /// What happened
    pub message: String,
    /// Command the operator can run to follow up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
}

/// Bookkeeping for one phase
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    /// Phase name
    pub name: PhaseName,
    /// Current status
    pub status: PhaseStatus,
    /// Number of times the phase was started in this session
    pub attempts: u32,
    /// What the phase may have changed
    pub side_effect: SideEffect,
    /// Error class of a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClass>,
    /// Failure or degradation detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time spent running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl PhaseRecord {
    fn new(name: PhaseName) -> Self {
        Self {
            name,
            status: PhaseStatus::Pending,
            attempts: 0,
            side_effect: SideEffect::None,
            classification: None,
            message: None,
            elapsed_ms: None,
            started: None,
        }
    }
}

/// One orchestrator run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSession {
    /// Target environment
    pub environment: String,
    /// Image tag being deployed
    pub image_tag: Option<String>,
    /// Cloud region
    pub region: String,
    /// Unique run identifier
    pub run_id: String,
    /// Ordered phase records
    pub phases: Vec<PhaseRecord>,
    /// Resource handles bound so far
    pub handles: HandleRegistry,
    /// Non-fatal issues
    pub warnings: Vec<Warning>,
}

impl DeploymentSession {
    /// Create a session with every phase pending
    pub fn new(
        environment: impl Into<String>,
        image_tag: Option<String>,
        region: impl Into<String>,
        run_id: impl Into<String>,
        phases: &[PhaseName],
    ) -> Self {
        Self {
            environment: environment.into(),
            image_tag,
            region: region.into(),
            run_id: run_id.into(),
            phases: phases.iter().copied().map(PhaseRecord::new).collect(),
            handles: HandleRegistry::new(),
            warnings: Vec::new(),
        }
    }

    /// Record for `phase`
    pub fn record(&self, phase: PhaseName) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.name == phase)
    }

    /// Status of `phase`
    pub fn status(&self, phase: PhaseName) -> Option<PhaseStatus> {
        self.record(phase).map(|p| p.status)
    }

    fn transition(&mut self, phase: PhaseName, next: PhaseStatus) -> Result<&mut PhaseRecord> {
        let record = self
            .phases
            .iter_mut()
            .find(|p| p.name == phase)
            .ok_or_else(|| {
                Error::internal("session", format!("phase {} is not part of this run", phase))
            })?;
        if !record.status.can_become(next) {
            return Err(Error::internal(
                "session",
                format!("illegal transition for {}: {} -> {}", phase, record.status, next),
            ));
        }
        record.status = next;
        if next == PhaseStatus::Running {
            record.attempts += 1;
            record.started = Some(Instant::now());
        } else if let Some(started) = record.started {
            record.elapsed_ms = Some(started.elapsed().as_millis() as u64);
        }
        Ok(record)
    }

    /// Mark `phase` running
    pub fn start(&mut self, phase: PhaseName) -> Result<()> {
        self.transition(phase, PhaseStatus::Running).map(|_| ())
    }

    /// Mark `phase` succeeded
    pub fn succeed(&mut self, phase: PhaseName, side_effect: SideEffect) -> Result<()> {
        let record = self.transition(phase, PhaseStatus::Succeeded)?;
        record.side_effect = side_effect;
        Ok(())
    }

    /// Mark `phase` degraded and collect `warnings`
    pub fn degrade(&mut self, phase: PhaseName, warnings: Vec<Warning>) -> Result<()> {
        let summary = warnings
            .iter()
            .map(|w| w.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let record = self.transition(phase, PhaseStatus::Degraded)?;
        record.side_effect = SideEffect::Committed;
        record.message = Some(summary);
        for w in warnings {
            self.push_warning(w);
        }
        Ok(())
    }

    /// Mark `phase` failed (or cancelled, for [`ErrorClass::Cancelled`])
    pub fn fail(&mut self, phase: PhaseName, error: &Error, side_effect: SideEffect) -> Result<()> {
        let class = error.class();
        let next = if class == ErrorClass::Cancelled {
            PhaseStatus::Cancelled
        } else {
            PhaseStatus::Failed
        };
        let record = self.transition(phase, next)?;
        record.side_effect = side_effect;
        record.classification = Some(class);
        record.message = Some(error.to_string());
        Ok(())
    }

    /// Mark every still-pending phase skipped
    pub fn skip_pending(&mut self) {
        for record in self.phases.iter_mut() {
            if record.status == PhaseStatus::Pending {
                record.status = PhaseStatus::Skipped;
            }
        }
    }

    /// Collect a warning and log it
    pub fn push_warning(&mut self, warning: Warning) {
        warn!(source = %warning.source, kind = ?warning.kind, "{}", warning.message);
        self.warnings.push(warning);
    }

    /// First phase that failed or was cancelled
    pub fn first_failure(&self) -> Option<&PhaseRecord> {
        self.phases
            .iter()
            .find(|p| matches!(p.status, PhaseStatus::Failed | PhaseStatus::Cancelled))
    }
}
