//! Locust workload: manifest rendering, apply and readiness.
//!
//! Placeholders are substituted here and nowhere else. Partial readiness is a
//! warning that marks the deploy phase degraded; it never fails the run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info};

use loadstack_common::handles::LOCUST_UI_ENDPOINT;
use loadstack_common::session::{Warning, WarningKind};
use loadstack_common::{wait_for_value, Error, HandleRegistry, Result, WaitCondition, WaitOutcome};

use crate::config::{ReadinessTarget, WorkloadKind};
use crate::context::Context;

/// Placeholder values for one run
pub type Substitutions = BTreeMap<String, String>;

/// Build the substitution table from the run settings and pushed image
pub fn substitutions(ctx: &Context, image: &str) -> Substitutions {
    let workload = &ctx.config.workload;
    [
        ("IMAGE", image.to_string()),
        ("NAMESPACE", workload.namespace.clone()),
        ("ENVIRONMENT", ctx.environment.clone()),
        ("SCENARIO", workload.scenario.as_str().to_string()),
        ("WORKER_REPLICAS", workload.worker_replicas.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replace `${NAME}` placeholders, returning the text and any names left unresolved.
pub fn substitute(template: &str, values: &Substitutions) -> (String, Vec<String>) {
    let mut out = String::with_capacity(template.len());
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                let name = &after[..end];
                match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        if !unresolved.iter().any(|u| u == name) {
                            unresolved.push(name.to_string());
                        }
                        out.push_str(&rest[start..start + 3 + end]);
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    (out, unresolved)
}

/// Manifests written to the run workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSet {
    /// Directory holding the rendered files
    pub dir: PathBuf,
    /// Rendered files, in apply order
    pub files: Vec<PathBuf>,
}

/// Resources `kubectl apply -o name` reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSet {
    /// `kind.group/name` entries
    pub resources: Vec<String>,
}

impl AppliedSet {
    /// Whether a workload with this kind and name was applied
    pub fn contains(&self, kind: WorkloadKind, name: &str) -> bool {
        let prefix = format!("{}.", kind.resource());
        self.resources.iter().any(|r| {
            r.split_once('/')
                .map(|(k, n)| n == name && (k == kind.resource() || k.starts_with(&prefix)))
                .unwrap_or(false)
        })
    }
}

/// A readiness target that did not reach its minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Workload name
    pub name: String,
    /// Ready replicas last observed
    pub ready: u32,
    /// Minimum required
    pub required: u32,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {}/{} ready",
            self.kind.resource(),
            self.name,
            self.ready,
            self.required
        )
    }
}

/// How readiness resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every target met its minimum
    Ready,
    /// The wait timed out with these targets short
    Degraded(Vec<Shortfall>),
}

/// Applies the workload and waits for it
pub struct WorkloadDeployer<'a> {
    ctx: &'a Context,
}

impl<'a> WorkloadDeployer<'a> {
    /// Create a deployer for `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    fn namespace(&self) -> &str {
        &self.ctx.config.workload.namespace
    }

    /// Render every `*.yaml`/`*.yml` template in `definitions_dir`, in name order.
    pub fn render(&self, definitions_dir: &Path, values: &Substitutions) -> Result<RenderedSet> {
        let mut templates: Vec<PathBuf> = std::fs::read_dir(definitions_dir)
            .map_err(|e| {
                Error::configuration(format!(
                    "cannot read manifest directory {}: {}",
                    definitions_dir.display(),
                    e
                ))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        templates.sort();

        if templates.is_empty() {
            return Err(Error::configuration(format!(
                "no manifest templates in {}",
                definitions_dir.display()
            )));
        }

        let out_dir = self.ctx.workspace.rendered_dir();
        std::fs::create_dir_all(&out_dir)?;
        let mut files = Vec::with_capacity(templates.len());
        for template in &templates {
            let content = std::fs::read_to_string(template)?;
            let (rendered, unresolved) = substitute(&content, values);
            if !unresolved.is_empty() {
                return Err(Error::configuration(format!(
                    "unresolved placeholder(s) {} in {}",
                    unresolved
                        .iter()
                        .map(|u| format!("${{{}}}", u))
                        .collect::<Vec<_>>()
                        .join(", "),
                    template.display()
                )));
            }
            let file_name = template.file_name().ok_or_else(|| {
                Error::internal(
                    "render",
                    format!("template without file name: {}", template.display()),
                )
            })?;
            let target = out_dir.join(file_name);
            std::fs::write(&target, rendered)?;
            files.push(target);
        }

        debug!(count = files.len(), dir = %out_dir.display(), "Rendered manifests");
        Ok(RenderedSet {
            dir: out_dir,
            files,
        })
    }

    /// Ensure the namespace exists, then apply the rendered manifests.
    pub async fn apply(&self, rendered: &RenderedSet) -> Result<AppliedSet> {
        let namespace_doc = format!(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n  labels:\n    app.kubernetes.io/managed-by: loadstack\n",
            self.namespace()
        );
        let ns = self
            .ctx
            .kubectl()
            .args(["apply", "--server-side", "--field-manager=loadstack", "-f", "-"])
            .stdin(namespace_doc);
        self.ctx.run_checked(&ns).await?;

        info!(namespace = %self.namespace(), "Applying workload manifests...");
        let inv = self
            .ctx
            .kubectl()
            .args(["apply", "-n", self.namespace(), "-f"])
            .arg(rendered.dir.display().to_string())
            .args(["-o", "name"]);
        let out = self.ctx.run_checked(&inv).await?;
        let resources: Vec<String> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        info!(count = resources.len(), "Applied workload resources");
        Ok(AppliedSet { resources })
    }

    async fn ready_replicas(&self, target: &ReadinessTarget) -> Result<u32> {
        let inv = self.ctx.kubectl().args([
            "get",
            target.kind.resource(),
            target.name.as_str(),
            "-n",
            self.namespace(),
            "-o",
            "json",
        ]);
        let out = self.ctx.run_checked(&inv).await?;
        let parse_err = |e: serde_json::Error| {
            Error::contract_violation(
                format!("kubectl get {}", target.kind.resource()),
                format!("unparseable {}: {}", target.name, e),
            )
        };
        let ready = match target.kind {
            WorkloadKind::Deployment => serde_json::from_str::<Deployment>(&out.stdout)
                .map_err(parse_err)?
                .status
                .and_then(|s| s.ready_replicas),
            WorkloadKind::StatefulSet => serde_json::from_str::<StatefulSet>(&out.stdout)
                .map_err(parse_err)?
                .status
                .and_then(|s| s.ready_replicas),
        };
        Ok(ready.unwrap_or(0).max(0) as u32)
    }

    async fn observe(&self, targets: &[ReadinessTarget]) -> Vec<Shortfall> {
        let mut short = Vec::new();
        for target in targets {
            let ready = match self.ready_replicas(target).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(target = %target.name, error = %e, "Readiness check failed");
                    0
                }
            };
            if ready < target.min_ready {
                short.push(Shortfall {
                    kind: target.kind,
                    name: target.name.clone(),
                    ready,
                    required: target.min_ready,
                });
            }
        }
        short
    }

    /// Wait until every target reaches its minimum ready replicas.
    pub async fn wait_for_ready(
        &self,
        applied: &AppliedSet,
        targets: &[ReadinessTarget],
    ) -> Result<Readiness> {
        if !applied.resources.is_empty() {
            if let Some(missing) = targets.iter().find(|t| !applied.contains(t.kind, &t.name)) {
                return Err(Error::contract_violation(
                    "kubectl apply",
                    format!(
                        "readiness target {}/{} is not among the applied resources",
                        missing.kind.resource(),
                        missing.name
                    ),
                ));
            }
        }

        let workload = &self.ctx.config.workload;
        let condition = WaitCondition::new(
            format!("workload readiness in namespace {}", self.namespace()),
            Duration::from_secs(workload.poll_interval_secs),
            Duration::from_secs(workload.ready_timeout_secs),
        )?;

        info!(targets = targets.len(), "Waiting for workload readiness...");
        let last = Mutex::new(Vec::<Shortfall>::new());
        let last_ref = &last;
        let outcome = wait_for_value(&condition, &self.ctx.cancel, move || async move {
            let short = self.observe(targets).await;
            let done = short.is_empty();
            if let Ok(mut slot) = last_ref.lock() {
                *slot = short;
            }
            Ok::<_, Error>(done.then_some(()))
        })
        .await;

        match outcome {
            WaitOutcome::Satisfied(()) => {
                info!("Workload ready");
                Ok(Readiness::Ready)
            }
            WaitOutcome::TimedOut => {
                let short = last.lock().map(|s| s.clone()).unwrap_or_default();
                Ok(Readiness::Degraded(short))
            }
            WaitOutcome::Cancelled => Err(Error::cancelled("waiting for workload readiness")),
        }
    }

    async fn service_endpoint(&self, service: &str) -> Result<Option<String>> {
        let inv = self
            .ctx
            .kubectl()
            .args(["get", "service", service, "-n", self.namespace(), "-o", "json"]);
        let out = self.ctx.run_checked(&inv).await?;
        let svc: Service = serde_json::from_str(&out.stdout).map_err(|e| {
            Error::contract_violation("kubectl get service", format!("unparseable service: {}", e))
        })?;

        let address = svc
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .and_then(|ingress| {
                ingress
                    .into_iter()
                    .find_map(|i| i.hostname.or(i.ip).filter(|a| !a.is_empty()))
            });
        let port = svc
            .spec
            .and_then(|s| s.ports)
            .and_then(|ports| ports.first().map(|p| p.port))
            .unwrap_or(80);
        Ok(address.map(|a| format!("http://{}:{}", a, port)))
    }

    /// Wait for the UI service's load-balancer address.
    ///
    /// Returns `None` on timeout; the caller turns that into a warning.
    pub async fn wait_for_endpoint(&self, service: &str) -> Result<Option<String>> {
        let workload = &self.ctx.config.workload;
        let condition = WaitCondition::new(
            format!("load balancer address for service {}", service),
            Duration::from_secs(workload.poll_interval_secs),
            Duration::from_secs(workload.endpoint_timeout_secs),
        )?;
        info!(service = %service, "Waiting for Locust UI address...");
        let endpoint = move || self.service_endpoint(service);
        match wait_for_value(&condition, &self.ctx.cancel, endpoint).await {
            WaitOutcome::Satisfied(endpoint) => {
                info!(endpoint = %endpoint, "Locust UI available");
                Ok(Some(endpoint))
            }
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Cancelled => Err(Error::cancelled("waiting for the Locust UI address")),
        }
    }

    fn follow_up(&self, shortfalls: &[Shortfall]) -> String {
        let kubeconfig = self.ctx.workspace.kubeconfig();
        match shortfalls.first() {
            Some(s) => format!(
                "KUBECONFIG={} kubectl -n {} describe {} {}",
                kubeconfig.display(),
                self.namespace(),
                s.kind.resource(),
                s.name
            ),
            None => format!(
                "KUBECONFIG={} kubectl -n {} get pods",
                kubeconfig.display(),
                self.namespace()
            ),
        }
    }

    /// Render, apply, wait for readiness and for the UI address.
    ///
    /// Returns the warnings the run should carry; a
    /// [`WarningKind::DegradedReadiness`] among them marks the phase degraded.
    pub async fn deploy(&self, handles: &mut HandleRegistry, image: &str) -> Result<Vec<Warning>> {
        let workload = &self.ctx.config.workload;
        let values = substitutions(self.ctx, image);
        let rendered = self.render(&workload.manifests_dir, &values)?;
        let applied = self.apply(&rendered).await?;

        let mut warnings = Vec::new();
        let targets = workload.readiness_targets();
        if let Readiness::Degraded(short) = self.wait_for_ready(&applied, &targets).await? {
            let follow_up = self.follow_up(&short);
            for s in &short {
                warnings.push(Warning {
                    kind: WarningKind::DegradedReadiness,
                    source: "deploy".to_string(),
                    message: format!("{} after {}s", s, workload.ready_timeout_secs),
                    follow_up: Some(follow_up.clone()),
                });
            }
            if short.is_empty() {
                warnings.push(Warning {
                    kind: WarningKind::DegradedReadiness,
                    source: "deploy".to_string(),
                    message: format!(
                        "workload not confirmed ready after {}s",
                        workload.ready_timeout_secs
                    ),
                    follow_up: Some(follow_up),
                });
            }
        }

        if let Some(service) = &workload.ui_service {
            match self.wait_for_endpoint(service).await? {
                Some(endpoint) => handles.bind(LOCUST_UI_ENDPOINT, &endpoint, "deploy")?,
                None => warnings.push(Warning {
                    kind: WarningKind::EndpointPending,
                    source: "deploy".to_string(),
                    message: format!(
                        "service {} has no load balancer address after {}s",
                        service, workload.endpoint_timeout_secs
                    ),
                    follow_up: Some(format!(
                        "KUBECONFIG={} kubectl -n {} get service {} -w",
                        self.ctx.workspace.kubeconfig().display(),
                        self.namespace(),
                        service
                    )),
                }),
            }
        }
        Ok(warnings)
    }
}
