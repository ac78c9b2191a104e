//! Cluster credentials and node capacity.
//!
//! Credentials go into the run workspace's own kubeconfig so the operator's
//! `~/.kube/config` is never modified.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;
use tracing::info;

use loadstack_common::handles::CLUSTER_NAME;
use loadstack_common::{wait_for_value, Error, HandleRegistry, Result, WaitCondition, WaitOutcome};

use crate::context::Context;

/// `kubectl get <kind> -o json` wraps results in a generic `List`
#[derive(Debug, Deserialize)]
pub(crate) struct KubeList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Credentials written for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialContext {
    /// Cluster the credentials belong to
    pub cluster_name: String,
    /// Kubeconfig holding them
    pub kubeconfig: PathBuf,
    /// Context name inside the kubeconfig
    pub alias: String,
}

/// Whether a node is Ready and accepts pods
pub(crate) fn node_schedulable(node: &Node) -> bool {
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    ready && !cordoned
}

/// Configures and verifies access to the provisioned cluster
pub struct AccessConfigurer<'a> {
    ctx: &'a Context,
}

impl<'a> AccessConfigurer<'a> {
    /// Create a configurer for `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Write credentials for the cluster named by the `cluster_name` handle.
    pub async fn configure_access(&self, handles: &HandleRegistry) -> Result<CredentialContext> {
        let cluster_name = handles.require(CLUSTER_NAME, "configureAccess")?.to_string();
        let kubeconfig = self.ctx.workspace.kubeconfig();
        let alias = format!("loadstack-{}", self.ctx.environment);

        info!(
            cluster = %cluster_name,
            kubeconfig = %kubeconfig.display(),
            "Configuring cluster access..."
        );
        let inv = self.ctx.aws().args([
            "eks".to_string(),
            "update-kubeconfig".to_string(),
            "--name".to_string(),
            cluster_name.clone(),
            "--region".to_string(),
            self.ctx.region.clone(),
            "--kubeconfig".to_string(),
            kubeconfig.display().to_string(),
            "--alias".to_string(),
            alias.clone(),
        ]);
        self.ctx.run_checked(&inv).await?;

        Ok(CredentialContext {
            cluster_name,
            kubeconfig,
            alias,
        })
    }

    async fn count_schedulable_nodes(&self) -> Result<usize> {
        let inv = self.ctx.kubectl().args(["get", "nodes", "-o", "json"]);
        let out = self.ctx.run_checked(&inv).await?;
        let nodes: KubeList<Node> = serde_json::from_str(&out.stdout).map_err(|e| {
            Error::contract_violation("kubectl get nodes", format!("unparseable node list: {}", e))
        })?;
        Ok(nodes.items.iter().filter(|n| node_schedulable(n)).count())
    }

    /// Wait until the cluster has `min_ready_nodes` Ready, schedulable nodes.
    ///
    /// Running out of time is fatal: nothing is deployed onto a cluster
    /// without the capacity it was sized for.
    pub async fn verify(&self, credentials: &CredentialContext) -> Result<usize> {
        let cluster = &self.ctx.config.cluster;
        let min = cluster.min_ready_nodes as usize;
        let condition = WaitCondition::new(
            format!(
                "{} ready schedulable nodes in cluster {}",
                min, credentials.cluster_name
            ),
            Duration::from_secs(cluster.poll_interval_secs),
            Duration::from_secs(cluster.ready_timeout_secs),
        )?;

        info!(cluster = %credentials.cluster_name, min_ready = min, "Waiting for node capacity...");
        let last_seen = AtomicUsize::new(0);
        let seen = &last_seen;
        let outcome = wait_for_value(&condition, &self.ctx.cancel, move || async move {
            let ready = self.count_schedulable_nodes().await?;
            if ready != seen.swap(ready, Ordering::Relaxed) {
                info!(ready, min_ready = min, "Schedulable nodes");
            }
            Ok::<_, Error>((ready >= min).then_some(ready))
        })
        .await;

        match outcome {
            WaitOutcome::Satisfied(ready) => {
                info!(ready, "Cluster capacity available");
                Ok(ready)
            }
            WaitOutcome::TimedOut => Err(Error::readiness_timeout(
                format!(
                    "{} (last seen {})",
                    condition.description(),
                    last_seen.load(Ordering::Relaxed)
                ),
                condition.timeout(),
            )),
            WaitOutcome::Cancelled => Err(Error::cancelled("waiting for cluster nodes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context_with, nodes_json, TF_HANDLES};
    use loadstack_common::testing::{fail, ok, ScriptedRunner};
    use loadstack_common::ErrorClass;
    use std::sync::Arc;

    fn handles() -> HandleRegistry {
        let mut h = HandleRegistry::new();
        for (name, value) in TF_HANDLES {
            h.bind(name, value, "provision").unwrap();
        }
        h
    }

    #[tokio::test]
    async fn configure_access_targets_run_kubeconfig() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("aws", &["eks", "update-kubeconfig"], ok("Added new context"));
        let (ctx, _dir) = context_with(runner.clone());

        let creds = AccessConfigurer::new(&ctx)
            .configure_access(&handles())
            .await
            .unwrap();

        assert_eq!(creds.alias, "loadstack-dev");
        assert_eq!(creds.kubeconfig, ctx.workspace.kubeconfig());
        let call = &runner.calls()[0];
        assert!(call.contains("--name loadstack-dev"));
        assert!(call.contains(&format!("--kubeconfig {}", ctx.workspace.kubeconfig().display())));
    }

    #[tokio::test]
    async fn configure_access_requires_cluster_handle() {
        let runner = Arc::new(ScriptedRunner::new());
        let (ctx, _dir) = context_with(runner.clone());

        let err = AccessConfigurer::new(&ctx)
            .configure_access(&HandleRegistry::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ContractViolation);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn cordoned_and_not_ready_nodes_do_not_count() {
        let json = nodes_json(&[(true, false), (true, true), (false, false)]);
        let list: KubeList<Node> = serde_json::from_str(&json).unwrap();
        let schedulable = list.items.iter().filter(|n| node_schedulable(n)).count();
        assert_eq!(schedulable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn verify_waits_for_capacity() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_sequence(
            "kubectl",
            &["get", "nodes"],
            vec![
                fail(1, "Unable to connect to the server"),
                ok(&nodes_json(&[(true, false)])),
                ok(&nodes_json(&[(true, false), (true, false)])),
            ],
        );
        let (ctx, _dir) = context_with(runner.clone());
        let creds = CredentialContext {
            cluster_name: "loadstack-dev".into(),
            kubeconfig: ctx.workspace.kubeconfig(),
            alias: "loadstack-dev".into(),
        };

        let ready = AccessConfigurer::new(&ctx).verify(&creds).await.unwrap();
        assert_eq!(ready, 2);
        assert_eq!(runner.count("kubectl get nodes"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_capacity_is_fatal_timeout() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("kubectl", &["get", "nodes"], ok(&nodes_json(&[(true, false)])));
        let (ctx, _dir) = context_with(runner);
        let creds = CredentialContext {
            cluster_name: "loadstack-dev".into(),
            kubeconfig: ctx.workspace.kubeconfig(),
            alias: "loadstack-dev".into(),
        };

        let err = AccessConfigurer::new(&ctx).verify(&creds).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ReadinessTimeout);
        assert!(err.to_string().contains("last seen 1"));
    }
}
