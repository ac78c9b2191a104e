//! Phase pipeline controller
//!
//! Runs the forward phases strictly in order. The first fatal error marks its
//! phase failed (or cancelled), skips every later phase and ends the run;
//! committed phases are never rolled back. Degraded workload readiness is
//! recorded as a warning and the run still succeeds.

use serde::Serialize;
use tracing::{error, info};

use loadstack_common::handles::{IMAGE_REFERENCE, REGISTRY_URL};
use loadstack_common::session::{DeploymentSession, PhaseName, SideEffect, Warning, WarningKind};
use loadstack_common::{Error, ErrorClass, Result};

use crate::access::AccessConfigurer;
use crate::context::Context;
use crate::prerequisites::{PrerequisiteValidator, Purpose};
use crate::provisioner::{ChangeSummary, Provisioner};
use crate::publisher::Publisher;
use crate::report::{Failure, NextCommand};
use crate::workload::WorkloadDeployer;

/// What the run does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Full forward pipeline for an image tag
    Deploy {
        /// Image tag to build and deploy
        image_tag: String,
    },
    /// Validate and plan only
    PlanOnly,
}

impl Mode {
    fn phases(&self) -> &'static [PhaseName] {
        match self {
            Mode::Deploy { .. } => &PhaseName::FORWARD,
            Mode::PlanOnly => &PhaseName::PLAN_ONLY,
        }
    }

    fn image_tag(&self) -> Option<&str> {
        match self {
            Mode::Deploy { image_tag } => Some(image_tag),
            Mode::PlanOnly => None,
        }
    }
}

/// Everything a forward run produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    /// Session state at exit
    pub session: DeploymentSession,
    /// Infrastructure plan, when one was made
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<ChangeSummary>,
    /// First fatal error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl PipelineReport {
    /// Process exit code
    pub fn exit_code(&self) -> u8 {
        self.failure.as_ref().map(|f| f.class.exit_code()).unwrap_or(0)
    }
}

enum PhaseResult {
    Done(SideEffect),
    Degraded(Vec<Warning>),
}

/// Drives the forward phases for one run
pub struct Pipeline<'a> {
    ctx: &'a Context,
    mode: Mode,
    change_summary: Option<ChangeSummary>,
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline for `ctx`
    pub fn new(ctx: &'a Context, mode: Mode) -> Self {
        Self {
            ctx,
            mode,
            change_summary: None,
        }
    }

    fn rerun_command(&self) -> String {
        match &self.mode {
            Mode::Deploy { image_tag } => {
                format!("loadstack deploy {} {}", self.ctx.environment, image_tag)
            }
            Mode::PlanOnly => format!("loadstack plan {}", self.ctx.environment),
        }
    }

    /// Run every phase, then write `handles.json`.
    pub async fn run(mut self) -> PipelineReport {
        let phases = self.mode.phases();
        let mut session = DeploymentSession::new(
            self.ctx.environment.clone(),
            self.mode.image_tag().map(String::from),
            self.ctx.region.clone(),
            self.ctx.workspace.run_id(),
            phases,
        );
        let mut failure = None;

        for &phase in phases {
            if let Err(e) = self.run_phase(phase, &mut session).await {
                error!(phase = %phase, class = %e.class(), error = %e, "Phase failed");
                let next = NextCommand::new(self.ctx, self.rerun_command()).for_error(&e);
                failure = Some(Failure::new(phase.as_str(), &e, next));
                session.skip_pending();
                break;
            }
        }

        if !session.handles.is_empty() {
            if let Err(e) = session.handles.write_summary(&self.ctx.workspace.handles_json()) {
                session.push_warning(Warning {
                    kind: WarningKind::Notice,
                    source: "report".to_string(),
                    message: format!("could not write handles.json: {}", e),
                    follow_up: None,
                });
            }
        }

        PipelineReport {
            session,
            change_summary: self.change_summary,
            failure,
        }
    }

    async fn run_phase(&mut self, phase: PhaseName, session: &mut DeploymentSession) -> Result<()> {
        session.start(phase)?;
        info!(phase = %phase, "Phase started");

        match self.execute(phase, session).await {
            Ok(PhaseResult::Done(side_effect)) => {
                session.succeed(phase, side_effect)?;
                info!(phase = %phase, "Phase succeeded");
                Ok(())
            }
            Ok(PhaseResult::Degraded(warnings)) => {
                session.degrade(phase, warnings)?;
                info!(phase = %phase, "Phase degraded");
                Ok(())
            }
            Err(e) => {
                session.fail(phase, &e, failure_side_effect(phase, &e))?;
                Err(e)
            }
        }
    }

    async fn execute(
        &mut self,
        phase: PhaseName,
        session: &mut DeploymentSession,
    ) -> Result<PhaseResult> {
        match phase {
            PhaseName::Validate => {
                let purpose = match self.mode {
                    Mode::Deploy { .. } => Purpose::Deploy,
                    Mode::PlanOnly => Purpose::Plan,
                };
                PrerequisiteValidator::new(self.ctx)
                    .validate(purpose, &mut session.handles)
                    .await?;
                Ok(PhaseResult::Done(SideEffect::None))
            }
            PhaseName::Plan => {
                let summary = self.plan().await?;
                self.change_summary = Some(summary);
                Ok(PhaseResult::Done(SideEffect::None))
            }
            PhaseName::Provision => {
                let summary = self.plan().await?;
                let provisioner = Provisioner::new(self.ctx);
                provisioner.apply(&summary).await?;
                self.change_summary = Some(summary);
                provisioner
                    .bind_outputs(&mut session.handles, phase.as_str(), true)
                    .await?;
                Ok(PhaseResult::Done(SideEffect::Committed))
            }
            PhaseName::ConfigureAccess => {
                let access = AccessConfigurer::new(self.ctx);
                let credentials = access.configure_access(&session.handles).await?;
                access.verify(&credentials).await?;
                Ok(PhaseResult::Done(SideEffect::None))
            }
            PhaseName::Publish => {
                let tag = self
                    .mode
                    .image_tag()
                    .ok_or_else(|| Error::internal("publish", "no image tag in this run"))?;
                let registry = session.handles.require(REGISTRY_URL, phase.as_str())?.to_string();
                let publisher = Publisher::new(self.ctx);
                publisher.authenticate(&registry).await?;
                let local = publisher.build(tag).await?;
                let image = publisher.push(&local, &registry, tag).await?;
                session
                    .handles
                    .bind(IMAGE_REFERENCE, &image.to_string(), phase.as_str())?;
                Ok(PhaseResult::Done(SideEffect::Committed))
            }
            PhaseName::Deploy => {
                let image = session.handles.require(IMAGE_REFERENCE, phase.as_str())?.to_string();
                let warnings = WorkloadDeployer::new(self.ctx)
                    .deploy(&mut session.handles, &image)
                    .await?;
                if warnings.iter().any(|w| w.kind == WarningKind::DegradedReadiness) {
                    return Ok(PhaseResult::Degraded(warnings));
                }
                for w in warnings {
                    session.push_warning(w);
                }
                Ok(PhaseResult::Done(SideEffect::Committed))
            }
        }
    }

    async fn plan(&self) -> Result<ChangeSummary> {
        let provisioner = Provisioner::new(self.ctx);
        provisioner.init().await?;
        provisioner.validate().await?;
        provisioner.plan().await
    }
}

/// What a failed phase may have left behind
fn failure_side_effect(phase: PhaseName, error: &Error) -> SideEffect {
    match (phase, error.class()) {
        (_, ErrorClass::LockContention | ErrorClass::Prerequisite | ErrorClass::Configuration) => {
            SideEffect::None
        }
        (PhaseName::Provision | PhaseName::Publish | PhaseName::Deploy, _) => SideEffect::Partial,
        _ => SideEffect::None,
    }
}
