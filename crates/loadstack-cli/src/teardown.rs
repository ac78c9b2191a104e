//! Teardown sequencer
//!
//! Reverses a deployment in a fixed order:
//!
//! 1. `start`: init Terraform, read outputs into handles, configure access
//! 2. `releaseExternalEndpoints`: delete every LoadBalancer Service
//! 3. `releaseWorkloads`: delete Deployments, StatefulSets and Jobs
//! 4. `releaseNamespacedState`: delete the workload namespace
//! 5. `waitForNetworkInterfaceRelease`: wait for load-balancer ENIs to go away
//! 6. `destroyInfrastructure`: `terraform destroy`
//! 7. `releaseArtifacts`: delete the image repository
//!
//! Deleting a VPC while AWS still holds load-balancer network interfaces in
//! it fails, which is what steps 2 and 5 exist for. Every step tolerates
//! resources that are already gone, so a partial teardown can be re-run.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tracing::{debug, error, info, warn};

use loadstack_common::handles::{CLUSTER_NAME, REGISTRY_URL, VPC_ID};
use loadstack_common::session::{Warning, WarningKind};
use loadstack_common::{
    wait_for_value, Error, ErrorClass, HandleRegistry, Result, WaitCondition, WaitOutcome,
};

use crate::access::{AccessConfigurer, KubeList};
use crate::context::Context;
use crate::provisioner::Provisioner;
use crate::publisher::Publisher;
use crate::report::{Failure, NextCommand};

/// Teardown state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TeardownStep {
    /// Initialise state and access
    Start,
    /// Delete LoadBalancer Services
    ReleaseExternalEndpoints,
    /// Delete workload controllers
    ReleaseWorkloads,
    /// Delete the workload namespace
    ReleaseNamespacedState,
    /// Wait for load-balancer network interfaces to disappear
    WaitForNetworkInterfaceRelease,
    /// `terraform destroy`
    DestroyInfrastructure,
    /// Delete the image repository
    ReleaseArtifacts,
    /// Terminal state
    Done,
}

impl TeardownStep {
    /// Steps in execution order, excluding `Done`
    pub const SEQUENCE: [TeardownStep; 7] = [
        TeardownStep::Start,
        TeardownStep::ReleaseExternalEndpoints,
        TeardownStep::ReleaseWorkloads,
        TeardownStep::ReleaseNamespacedState,
        TeardownStep::WaitForNetworkInterfaceRelease,
        TeardownStep::DestroyInfrastructure,
        TeardownStep::ReleaseArtifacts,
    ];

    /// Name as shown in reports
    pub fn as_str(self) -> &'static str {
        match self {
            TeardownStep::Start => "start",
            TeardownStep::ReleaseExternalEndpoints => "releaseExternalEndpoints",
            TeardownStep::ReleaseWorkloads => "releaseWorkloads",
            TeardownStep::ReleaseNamespacedState => "releaseNamespacedState",
            TeardownStep::WaitForNetworkInterfaceRelease => "waitForNetworkInterfaceRelease",
            TeardownStep::DestroyInfrastructure => "destroyInfrastructure",
            TeardownStep::ReleaseArtifacts => "releaseArtifacts",
            TeardownStep::Done => "done",
        }
    }

    fn needs_cluster(self) -> bool {
        matches!(
            self,
            TeardownStep::ReleaseExternalEndpoints
                | TeardownStep::ReleaseWorkloads
                | TeardownStep::ReleaseNamespacedState
        )
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(before, after)`: `after` never starts until `before` has resolved.
pub const ORDER_CONSTRAINTS: &[(TeardownStep, TeardownStep)] = &[
    (TeardownStep::Start, TeardownStep::ReleaseExternalEndpoints),
    (TeardownStep::ReleaseExternalEndpoints, TeardownStep::ReleaseWorkloads),
    (TeardownStep::ReleaseWorkloads, TeardownStep::ReleaseNamespacedState),
    (TeardownStep::ReleaseExternalEndpoints, TeardownStep::WaitForNetworkInterfaceRelease),
    (TeardownStep::ReleaseNamespacedState, TeardownStep::DestroyInfrastructure),
    (TeardownStep::WaitForNetworkInterfaceRelease, TeardownStep::DestroyInfrastructure),
    (TeardownStep::DestroyInfrastructure, TeardownStep::ReleaseArtifacts),
];

/// How a step resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum StepOutcome {
    /// Ran to completion
    Completed,
    /// Not run
    Skipped {
        /// Why
        reason: String,
    },
    /// Gave up waiting and let later steps proceed
    Overridden {
        /// What was left unresolved
        reason: String,
    },
    /// Unrecoverable; teardown stopped here
    Failed {
        /// Error class
        class: ErrorClass,
        /// Error message
        message: String,
    },
}

impl StepOutcome {
    /// Whether steps constrained to come after this one may start
    pub fn unblocks(&self) -> bool {
        !matches!(self, StepOutcome::Failed { .. })
    }
}

/// Result of one teardown step
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Step
    pub step: TeardownStep,
    /// Outcome
    #[serde(flatten)]
    pub outcome: StepOutcome,
    /// Time spent
    pub elapsed_ms: u64,
}

/// Everything a teardown run produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    /// Target environment
    pub environment: String,
    /// Run identifier
    pub run_id: String,
    /// Last state reached
    pub state: TeardownStep,
    /// Steps in the order they resolved
    pub steps: Vec<StepRecord>,
    /// Handles read back from Terraform
    pub handles: HandleRegistry,
    /// Non-fatal issues
    pub warnings: Vec<Warning>,
    /// First unrecoverable failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl TeardownReport {
    /// Outcome of `step`, if it ran
    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }

    /// Process exit code
    pub fn exit_code(&self) -> u8 {
        self.failure.as_ref().map(|f| f.class.exit_code()).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeNetworkInterfaces {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInterface {
    network_interface_id: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    interface_type: Option<String>,
}

impl NetworkInterface {
    /// Created by ELB for a classic, network or gateway load balancer
    fn load_balancer_owned(&self) -> bool {
        let typed = matches!(
            self.interface_type.as_deref(),
            Some("network_load_balancer") | Some("gateway_load_balancer")
        );
        typed
            || self
                .description
                .as_deref()
                .map(|d| d.starts_with("ELB "))
                .unwrap_or(false)
    }
}

/// Drives one teardown run
pub struct TeardownSequencer<'a> {
    ctx: &'a Context,
    handles: HandleRegistry,
    steps: Vec<StepRecord>,
    warnings: Vec<Warning>,
    cluster_reachable: bool,
}

impl<'a> TeardownSequencer<'a> {
    /// Create a sequencer for `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            handles: HandleRegistry::new(),
            steps: Vec::new(),
            warnings: Vec::new(),
            cluster_reachable: false,
        }
    }

    fn namespace(&self) -> &str {
        &self.ctx.config.workload.namespace
    }

    fn delete_timeout_arg(&self) -> String {
        format!("--timeout={}s", self.ctx.config.teardown.delete_timeout_secs)
    }

    fn warn(
        &mut self,
        kind: WarningKind,
        step: TeardownStep,
        message: String,
        follow_up: Option<String>,
    ) {
        warn!(step = %step, "{}", message);
        self.warnings.push(Warning {
            kind,
            source: step.as_str().to_string(),
            message,
            follow_up,
        });
    }

    /// Refuse to start `step` while a step it depends on is unresolved.
    pub fn check_order(&self, step: TeardownStep) -> Result<()> {
        for (before, _) in ORDER_CONSTRAINTS.iter().filter(|(_, after)| *after == step) {
            let resolved = self
                .steps
                .iter()
                .any(|r| r.step == *before && r.outcome.unblocks());
            if !resolved {
                return Err(Error::internal(
                    "teardown",
                    format!("{} cannot start before {} has resolved", step, before),
                ));
            }
        }
        Ok(())
    }

    /// Run every step in order, stopping at the first unrecoverable one.
    pub async fn run(mut self) -> TeardownReport {
        let mut state = TeardownStep::Done;
        let mut failure = None;

        for step in TeardownStep::SEQUENCE {
            let started = Instant::now();
            let outcome = match self.check_order(step) {
                Ok(()) => {
                    info!(step = %step, "Teardown step");
                    self.execute(step).await
                }
                Err(e) => Err(e),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(outcome) => {
                    if let StepOutcome::Skipped { reason } = &outcome {
                        info!(step = %step, reason = %reason, "Step skipped");
                    }
                    self.steps.push(StepRecord {
                        step,
                        outcome,
                        elapsed_ms,
                    });
                }
                Err(e) => {
                    error!(step = %step, error = %e, "Teardown step failed");
                    self.steps.push(StepRecord {
                        step,
                        outcome: StepOutcome::Failed {
                            class: e.class(),
                            message: e.to_string(),
                        },
                        elapsed_ms,
                    });
                    failure = Some(Failure::new(step.as_str(), &e, self.next_command(&e)));
                    state = step;
                    break;
                }
            }
        }

        TeardownReport {
            environment: self.ctx.environment.clone(),
            run_id: self.ctx.workspace.run_id().to_string(),
            state,
            steps: self.steps,
            handles: self.handles,
            warnings: self.warnings,
            failure,
        }
    }

    fn next_command(&self, error: &Error) -> Option<String> {
        let rerun = format!("loadstack teardown {}", self.ctx.environment);
        NextCommand::new(self.ctx, rerun).for_error(error)
    }

    async fn execute(&mut self, step: TeardownStep) -> Result<StepOutcome> {
        if step.needs_cluster() && !self.cluster_reachable {
            return Ok(StepOutcome::Skipped {
                reason: "cluster not reachable".to_string(),
            });
        }
        match step {
            TeardownStep::Start => self.start().await,
            TeardownStep::ReleaseExternalEndpoints => self.release_external_endpoints().await,
            TeardownStep::ReleaseWorkloads => self.release_workloads().await,
            TeardownStep::ReleaseNamespacedState => self.release_namespace().await,
            TeardownStep::WaitForNetworkInterfaceRelease => self.wait_for_interface_release().await,
            TeardownStep::DestroyInfrastructure => {
                Provisioner::new(self.ctx).destroy().await?;
                Ok(StepOutcome::Completed)
            }
            TeardownStep::ReleaseArtifacts => self.release_artifacts().await,
            TeardownStep::Done => Ok(StepOutcome::Completed),
        }
    }

    async fn start(&mut self) -> Result<StepOutcome> {
        let provisioner = Provisioner::new(self.ctx);
        provisioner.init().await?;
        provisioner
            .bind_outputs(&mut self.handles, TeardownStep::Start.as_str(), false)
            .await?;

        if self.handles.get(CLUSTER_NAME).is_none() {
            self.warn(
                WarningKind::SkippedStep,
                TeardownStep::Start,
                "no cluster in Terraform outputs; skipping cluster-side cleanup".to_string(),
                None,
            );
            return Ok(StepOutcome::Completed);
        }

        match AccessConfigurer::new(self.ctx).configure_access(&self.handles).await {
            Ok(_) => self.cluster_reachable = true,
            Err(e) if e.class() == ErrorClass::Cancelled => return Err(e),
            Err(e) => self.warn(
                WarningKind::SkippedStep,
                TeardownStep::Start,
                format!("cannot configure cluster access ({}); skipping cluster-side cleanup", e),
                None,
            ),
        }
        Ok(StepOutcome::Completed)
    }

    async fn release_external_endpoints(&mut self) -> Result<StepOutcome> {
        let inv = self
            .ctx
            .kubectl()
            .args(["get", "services", "--all-namespaces", "-o", "json"]);
        let out = self.ctx.run_checked(&inv).await?;
        let services: KubeList<Service> = serde_json::from_str(&out.stdout).map_err(|e| {
            Error::contract_violation(
                "kubectl get services",
                format!("unparseable service list: {}", e),
            )
        })?;

        let load_balancers: Vec<(String, String)> = services
            .items
            .into_iter()
            .filter(|s| {
                s.spec.as_ref().and_then(|spec| spec.type_.as_deref()) == Some("LoadBalancer")
            })
            .filter_map(|s| Some((s.metadata.namespace?, s.metadata.name?)))
            .collect();

        if load_balancers.is_empty() {
            return Ok(StepOutcome::Skipped {
                reason: "no LoadBalancer services".to_string(),
            });
        }

        for (namespace, name) in &load_balancers {
            info!(service = %name, namespace = %namespace, "Deleting LoadBalancer service...");
            let inv = self
                .ctx
                .kubectl()
                .args(["delete", "service", name.as_str(), "-n", namespace.as_str()])
                .args(["--ignore-not-found", "--wait"])
                .arg(self.delete_timeout_arg());
            self.ctx.run_checked(&inv).await?;
        }
        Ok(StepOutcome::Completed)
    }

    async fn release_workloads(&mut self) -> Result<StepOutcome> {
        let inv = self
            .ctx
            .kubectl()
            .args(["delete", "deployments,statefulsets,jobs", "--all", "-n", self.namespace()])
            .args(["--ignore-not-found", "--wait"])
            .arg(self.delete_timeout_arg());
        self.ctx.run_checked(&inv).await?;
        Ok(StepOutcome::Completed)
    }

    async fn release_namespace(&mut self) -> Result<StepOutcome> {
        info!(namespace = %self.namespace(), "Deleting workload namespace...");
        let inv = self
            .ctx
            .kubectl()
            .args(["delete", "namespace", self.namespace()])
            .args(["--ignore-not-found", "--wait"])
            .arg(self.delete_timeout_arg());
        self.ctx.run_checked(&inv).await?;
        Ok(StepOutcome::Completed)
    }

    async fn load_balancer_interfaces(&self, vpc_id: &str) -> Result<Vec<String>> {
        let inv = self.ctx.aws().args([
            "ec2".to_string(),
            "describe-network-interfaces".to_string(),
            "--filters".to_string(),
            format!("Name=vpc-id,Values={}", vpc_id),
            "--output".to_string(),
            "json".to_string(),
        ]);
        let out = self.ctx.run_checked(&inv).await?;
        let described: DescribeNetworkInterfaces = serde_json::from_str(&out.stdout).map_err(|e| {
            Error::contract_violation(
                "aws ec2 describe-network-interfaces",
                format!("unparseable output: {}", e),
            )
        })?;
        Ok(described
            .network_interfaces
            .into_iter()
            .filter(NetworkInterface::load_balancer_owned)
            .map(|eni| eni.network_interface_id)
            .collect())
    }

    async fn wait_for_interface_release(&mut self) -> Result<StepOutcome> {
        let Some(vpc_id) = self.handles.get(VPC_ID).map(str::to_string) else {
            let reason =
                "no vpc_id handle; load balancer network interfaces were not checked".to_string();
            self.warn(
                WarningKind::TeardownOrderingTimeout,
                TeardownStep::WaitForNetworkInterfaceRelease,
                format!("{}; proceeding to destroy", reason),
                Some(format!(
                    "terraform -chdir={} output vpc_id",
                    self.ctx.config.terraform.dir.display()
                )),
            );
            return Ok(StepOutcome::Overridden { reason });
        };

        let ctx = self.ctx;
        let teardown = &ctx.config.teardown;
        let condition = WaitCondition::new(
            format!("load balancer network interfaces in {} to be released", vpc_id),
            Duration::from_secs(teardown.eni_poll_interval_secs),
            Duration::from_secs(teardown.eni_timeout_secs),
        )?;

        info!(vpc = %vpc_id, "Waiting for load balancer network interfaces to be released...");
        let remaining = Mutex::new(Vec::<String>::new());
        let this = &*self;
        let (vpc, last) = (vpc_id.as_str(), &remaining);
        let outcome = wait_for_value(&condition, &ctx.cancel, move || async move {
            let enis = this.load_balancer_interfaces(vpc).await?;
            debug!(count = enis.len(), "Load balancer network interfaces remaining");
            let released = enis.is_empty();
            if let Ok(mut slot) = last.lock() {
                *slot = enis;
            }
            Ok::<_, Error>(released.then_some(()))
        })
        .await;

        match outcome {
            WaitOutcome::Satisfied(()) => Ok(StepOutcome::Completed),
            WaitOutcome::Cancelled => {
                Err(Error::cancelled("waiting for network interface release"))
            }
            WaitOutcome::TimedOut => {
                let left = remaining.lock().map(|r| r.clone()).unwrap_or_default();
                let reason = if left.is_empty() {
                    format!(
                        "network interfaces in {} not confirmed released after {}s",
                        vpc_id, teardown.eni_timeout_secs
                    )
                } else {
                    format!(
                        "{} load balancer network interface(s) still in {} after {}s: {}",
                        left.len(),
                        vpc_id,
                        teardown.eni_timeout_secs,
                        left.join(", ")
                    )
                };
                self.warn(
                    WarningKind::TeardownOrderingTimeout,
                    TeardownStep::WaitForNetworkInterfaceRelease,
                    format!("{}; proceeding to destroy", reason),
                    Some(format!(
                        "aws ec2 describe-network-interfaces --region {} --filters Name=vpc-id,Values={}",
                        ctx.region, vpc_id
                    )),
                );
                Ok(StepOutcome::Overridden { reason })
            }
        }
    }

    async fn release_artifacts(&mut self) -> Result<StepOutcome> {
        let Some(registry) = self.handles.get(REGISTRY_URL).map(str::to_string) else {
            return Ok(StepOutcome::Skipped {
                reason: "no registry_url handle".to_string(),
            });
        };
        Publisher::new(self.ctx).release(&registry).await?;
        Ok(StepOutcome::Completed)
    }
}

/// Asks the operator a question and returns the typed answer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Show `prompt` and read one line
    async fn ask(&self, prompt: &str) -> Result<String>;
}

/// Prompts on stderr and reads answers line by line.
///
/// One reader serves every prompt so answers piped in ahead of time are not
/// lost to a dropped buffer.
pub struct TerminalConfirmer<R = BufReader<Stdin>> {
    input: tokio::sync::Mutex<R>,
}

impl TerminalConfirmer {
    /// Read answers from stdin
    pub fn new() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }
}

impl Default for TerminalConfirmer {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AsyncBufRead + Unpin + Send> TerminalConfirmer<R> {
    /// Read answers from `input`
    pub fn from_reader(input: R) -> Self {
        Self {
            input: tokio::sync::Mutex::new(input),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> Confirmer for TerminalConfirmer<R> {
    async fn ask(&self, prompt: &str) -> Result<String> {
        let mut stderr = tokio::io::stderr();
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.flush().await?;

        let mut line = String::new();
        self.input.lock().await.read_line(&mut line).await?;
        Ok(line.trim().to_string())
    }
}

/// Gate destructive teardown behind two confirmations.
///
/// The operator must answer `yes`, then type the environment name.
/// `assume_yes` skips both prompts.
pub async fn confirm_teardown(
    confirmer: &dyn Confirmer,
    environment: &str,
    assume_yes: bool,
) -> Result<bool> {
    if assume_yes {
        warn!(environment = %environment, "Teardown confirmation bypassed");
        return Ok(true);
    }

    let first = confirmer
        .ask(&format!(
            "This will destroy every resource of environment '{}'. Continue? [yes/no]: ",
            environment
        ))
        .await?;
    if first != "yes" {
        return Ok(false);
    }

    let second = confirmer
        .ask(&format!("Type the environment name ({}) to confirm: ", environment))
        .await?;
    Ok(second == environment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context_with, service_json, REGISTRY, TF_OUTPUTS};
    use loadstack_common::testing::{fail, ok, ScriptedRunner};
    use std::sync::Arc;

    const NO_ENIS: &str = r#"{"NetworkInterfaces": []}"#;
    const LB_ENIS: &str = r#"{"NetworkInterfaces": [
        {"NetworkInterfaceId": "eni-0aaa", "Description": "ELB net/a1b2/c3d4", "InterfaceType": "network_load_balancer"},
        {"NetworkInterfaceId": "eni-0bbb", "Description": "ELB app/x/y", "InterfaceType": "interface"},
        {"NetworkInterfaceId": "eni-0ccc", "Description": "aws-K8S-i-0123", "InterfaceType": "interface"}
    ]}"#;

    fn services_list() -> String {
        format!(
            r#"{{"apiVersion":"v1","kind":"List","items":[{},{}]}}"#,
            service_json(Some("a1b2.elb.amazonaws.com")),
            r#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"kubernetes","namespace":"default"},"spec":{"type":"ClusterIP"}}"#
        )
    }

    fn happy_path(runner: &ScriptedRunner) {
        runner.on("terraform", &["init"], ok(""));
        runner.on("terraform", &["output", "-json"], ok(TF_OUTPUTS));
        runner.on("terraform", &["destroy"], ok("Destroy complete! Resources: 42 destroyed."));
        runner.on("aws", &["eks", "update-kubeconfig"], ok("Added new context"));
        runner.on("aws", &["ec2", "describe-network-interfaces"], ok(NO_ENIS));
        runner.on("aws", &["ecr", "delete-repository"], ok("{}"));
        runner.on("kubectl", &["get", "services"], ok(&services_list()));
        runner.on("kubectl", &["delete"], ok(""));
    }

    #[test]
    fn order_constraints_follow_sequence() {
        let position = |s: TeardownStep| TeardownStep::SEQUENCE.iter().position(|x| *x == s);
        for (before, after) in ORDER_CONSTRAINTS {
            assert!(position(*before) < position(*after), "{} -> {}", before, after);
        }
    }

    #[test]
    fn load_balancer_interfaces_are_recognised() {
        let described: DescribeNetworkInterfaces = serde_json::from_str(LB_ENIS).unwrap();
        let owned: Vec<_> = described
            .network_interfaces
            .iter()
            .filter(|e| e.load_balancer_owned())
            .map(|e| e.network_interface_id.as_str())
            .collect();
        assert_eq!(owned, ["eni-0aaa", "eni-0bbb"]);
    }

    #[tokio::test]
    async fn destroy_is_refused_before_interface_wait() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = context_with(runner.clone());
        let sequencer = TeardownSequencer::new(&ctx);

        let err = sequencer
            .check_order(TeardownStep::DestroyInfrastructure)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Internal);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_teardown_runs_in_order() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        let (ctx, _dir) = context_with(runner.clone());

        let report = TeardownSequencer::new(&ctx).run().await;
        assert!(report.failure.is_none(), "{:?}", report.failure);
        assert_eq!(report.state, TeardownStep::Done);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.steps.len(), 7);

        let svc = runner.position("kubectl delete service locust-master").unwrap();
        let workloads = runner.position("kubectl delete deployments,statefulsets,jobs").unwrap();
        let ns = runner.position("kubectl delete namespace locust").unwrap();
        let eni = runner.position("aws ec2 describe-network-interfaces").unwrap();
        let destroy = runner.position("terraform destroy").unwrap();
        let release = runner.position("aws ecr delete-repository").unwrap();
        assert!(svc < workloads && workloads < ns && ns < eni);
        assert!(eni < destroy && destroy < release);
        assert!(!runner.calls().iter().any(|c| c.contains("service kubernetes")));
    }

    #[tokio::test(start_paused = true)]
    async fn lingering_interfaces_warn_and_destroy_proceeds() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        runner.on("aws", &["ec2", "describe-network-interfaces"], ok(LB_ENIS));
        let (ctx, _dir) = context_with(runner.clone());

        let report = TeardownSequencer::new(&ctx).run().await;
        assert_eq!(report.exit_code(), 0);
        assert!(matches!(
            report.outcome(TeardownStep::WaitForNetworkInterfaceRelease),
            Some(StepOutcome::Overridden { .. })
        ));
        let warning = report
            .warnings
            .iter()
            .find(|w| w.kind == WarningKind::TeardownOrderingTimeout)
            .unwrap();
        assert!(warning.message.contains("eni-0aaa"));

        let last_eni_check = runner
            .calls()
            .iter()
            .rposition(|c| c.contains("describe-network-interfaces"))
            .unwrap();
        assert!(runner.position("terraform destroy").unwrap() > last_eni_check);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_cluster_skips_cluster_steps() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        runner.on("terraform", &["output", "-json"], ok("{}"));
        let (ctx, _dir) = context_with(runner.clone());

        let report = TeardownSequencer::new(&ctx).run().await;
        assert_eq!(report.exit_code(), 0);
        assert_eq!(runner.count("kubectl"), 0);
        assert_eq!(runner.count("aws ec2 describe-network-interfaces"), 0);
        assert_eq!(runner.count("aws ecr delete-repository"), 0);
        assert_eq!(runner.count("terraform destroy"), 1);
        assert!(matches!(
            report.outcome(TeardownStep::ReleaseWorkloads),
            Some(StepOutcome::Skipped { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_vpc_handle_overrides_interface_wait_with_warning() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        let outputs = format!(
            r#"{{"cluster_name": {{"value": "loadstack-dev"}}, "ecr_repository_url": {{"value": "{}"}}}}"#,
            REGISTRY
        );
        runner.on("terraform", &["output", "-json"], ok(&outputs));
        let (ctx, _dir) = context_with(runner.clone());

        let report = TeardownSequencer::new(&ctx).run().await;
        assert_eq!(report.exit_code(), 0);
        assert!(matches!(
            report.outcome(TeardownStep::WaitForNetworkInterfaceRelease),
            Some(StepOutcome::Overridden { .. })
        ));
        let warning = report
            .warnings
            .iter()
            .find(|w| w.kind == WarningKind::TeardownOrderingTimeout)
            .unwrap();
        assert!(warning.message.contains("vpc_id"));
        assert!(warning.follow_up.as_deref().unwrap().ends_with("output vpc_id"));
        assert_eq!(runner.count("aws ec2 describe-network-interfaces"), 0);
        assert_eq!(runner.count("kubectl delete service locust-master"), 1);
        assert_eq!(runner.count("terraform destroy"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_cluster_is_a_warning() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        runner.on(
            "aws",
            &["eks", "update-kubeconfig"],
            fail(254, "ResourceNotFoundException: No cluster found for name: loadstack-dev"),
        );
        let (ctx, _dir) = context_with(runner.clone());

        let report = TeardownSequencer::new(&ctx).run().await;
        assert_eq!(report.exit_code(), 0);
        assert_eq!(runner.count("kubectl"), 0);
        assert!(report.warnings.iter().any(|w| w.kind == WarningKind::SkippedStep));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_failure_stops_teardown() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        runner.on(
            "terraform",
            &["destroy"],
            fail(1, "Error: deleting EC2 VPC (vpc-0abc): DependencyViolation"),
        );
        let (ctx, _dir) = context_with(runner.clone());

        let report = TeardownSequencer::new(&ctx).run().await;
        assert_eq!(report.state, TeardownStep::DestroyInfrastructure);
        assert_eq!(report.exit_code(), ErrorClass::Provisioning.exit_code());
        assert_eq!(runner.count("aws ecr delete-repository"), 0);
        let failure = report.failure.unwrap();
        assert_eq!(failure.next_command.as_deref(), Some("loadstack teardown dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_repository_counts_as_released() {
        let runner = Arc::new(ScriptedRunner::new());
        happy_path(&runner);
        runner.on(
            "aws",
            &["ecr", "delete-repository"],
            fail(254, "An error occurred (RepositoryNotFoundException)"),
        );
        let (ctx, _dir) = context_with(runner);

        let report = TeardownSequencer::new(&ctx).run().await;
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.handles.get(REGISTRY_URL), Some(REGISTRY));
    }

    #[tokio::test]
    async fn gate_requires_both_answers() {
        let mut confirmer = MockConfirmer::new();
        let mut answers = vec!["dev".to_string(), "yes".to_string()];
        confirmer
            .expect_ask()
            .times(2)
            .returning(move |_| Ok(answers.pop().unwrap_or_default()));

        assert!(confirm_teardown(&confirmer, "dev", false).await.unwrap());
    }

    #[tokio::test]
    async fn gate_denies_on_first_refusal() {
        let mut confirmer = MockConfirmer::new();
        confirmer
            .expect_ask()
            .times(1)
            .returning(|_| Ok("no".to_string()));

        assert!(!confirm_teardown(&confirmer, "dev", false).await.unwrap());
    }

    #[tokio::test]
    async fn gate_denies_on_wrong_environment_name() {
        let mut confirmer = MockConfirmer::new();
        let mut answers = vec!["prod".to_string(), "yes".to_string()];
        confirmer
            .expect_ask()
            .times(2)
            .returning(move |_| Ok(answers.pop().unwrap_or_default()));

        assert!(!confirm_teardown(&confirmer, "dev", false).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_gate_reads_both_answers_from_one_stream() {
        let confirmer = TerminalConfirmer::from_reader(BufReader::new(&b"yes\ndev\n"[..]));
        assert!(confirm_teardown(&confirmer, "dev", false).await.unwrap());

        let exhausted = TerminalConfirmer::from_reader(BufReader::new(&b"yes\n"[..]));
        assert!(!confirm_teardown(&exhausted, "dev", false).await.unwrap());
    }

    #[tokio::test]
    async fn assume_yes_never_prompts() {
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_ask().never();

        assert!(confirm_teardown(&confirmer, "dev", true).await.unwrap());
    }
}
