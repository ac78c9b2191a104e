//! Fixtures shared by the unit tests.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use loadstack_common::testing::ScriptedRunner;

use crate::config::EnvironmentConfig;
use crate::context::Context;
use crate::workspace::RunWorkspace;

pub const REGISTRY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/loadstack-dev-locust";

pub const IDENTITY: &str = r#"{
    "UserId": "AIDAEXAMPLE",
    "Account": "123456789012",
    "Arn": "arn:aws:iam::123456789012:user/operator"
}"#;

pub const PLAN_JSON: &str = r#"{
    "format_version": "1.2",
    "resource_changes": [
        {"address": "module.vpc.aws_vpc.this[0]", "change": {"actions": ["create"]}},
        {"address": "module.eks.aws_eks_cluster.this[0]", "change": {"actions": ["create"]}},
        {"address": "aws_ecr_repository.locust", "change": {"actions": ["create"]}},
        {"address": "data.aws_availability_zones.available", "change": {"actions": ["read"]}}
    ]
}"#;

pub const TF_OUTPUTS: &str = r#"{
    "cluster_name": {"sensitive": false, "type": "string", "value": "loadstack-dev"},
    "ecr_repository_url": {"sensitive": false, "type": "string", "value": "123456789012.dkr.ecr.us-east-1.amazonaws.com/loadstack-dev-locust"},
    "vpc_id": {"sensitive": false, "type": "string", "value": "vpc-0abc"},
    "cluster_endpoint": {"sensitive": false, "type": "string", "value": "https://ABC.gr7.us-east-1.eks.amazonaws.com"}
}"#;

pub const TF_HANDLES: [(&str, &str); 3] = [
    ("cluster_name", "loadstack-dev"),
    ("registry_url", REGISTRY),
    ("vpc_id", "vpc-0abc"),
];

/// Waits short enough for paused-clock tests
pub const FAST_CONFIG: &str = "\
cluster:
  ready_timeout_secs: 5
  poll_interval_secs: 1
workload:
  ready_timeout_secs: 5
  poll_interval_secs: 1
  endpoint_timeout_secs: 5
teardown:
  eni_timeout_secs: 5
  eni_poll_interval_secs: 1
  delete_timeout_secs: 30
";

const MASTER: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: locust-master
  namespace: ${NAMESPACE}
  labels:
    app.kubernetes.io/part-of: loadstack-${ENVIRONMENT}
spec:
  replicas: 1
  selector:
    matchLabels: {app: locust-master}
  template:
    metadata:
      labels: {app: locust-master}
    spec:
      containers:
        - name: locust
          image: ${IMAGE}
          args: [\"--master\"]
          env:
            - name: LOCUST_SCENARIO
              value: ${SCENARIO}
";

const WORKER: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: locust-worker
  namespace: ${NAMESPACE}
spec:
  replicas: ${WORKER_REPLICAS}
  selector:
    matchLabels: {app: locust-worker}
  template:
    metadata:
      labels: {app: locust-worker}
    spec:
      containers:
        - name: locust
          image: ${IMAGE}
          args: [\"--worker\", \"--master-host=locust-master\"]
          env:
            - name: LOCUST_SCENARIO
              value: ${SCENARIO}
";

const SERVICE: &str = "\
apiVersion: v1
kind: Service
metadata:
  name: locust-master
  namespace: ${NAMESPACE}
spec:
  type: LoadBalancer
  selector: {app: locust-master}
  ports:
    - {name: web, port: 8089, targetPort: 8089}
    - {name: comms, port: 5557, targetPort: 5557}
";

fn write_inputs(root: &Path) {
    let envs = root.join("terraform").join("environments");
    std::fs::create_dir_all(&envs).unwrap();
    std::fs::write(envs.join("dev.tfvars"), "environment = \"dev\"\nnode_count = 2\n").unwrap();

    let k8s = root.join("k8s");
    std::fs::create_dir_all(&k8s).unwrap();
    std::fs::write(k8s.join("10-master.yaml"), MASTER).unwrap();
    std::fs::write(k8s.join("20-worker.yaml"), WORKER).unwrap();
    std::fs::write(k8s.join("30-service.yml"), SERVICE).unwrap();
    std::fs::write(k8s.join("README.md"), "not a manifest").unwrap();

    std::fs::write(root.join("Dockerfile"), "FROM locustio/locust:2.31.0\n").unwrap();
}

/// Context for environment `dev` whose inputs live in a fresh temp directory.
pub fn context_from_yaml(runner: Arc<ScriptedRunner>, yaml: &str) -> (Context, TempDir) {
    let dir = TempDir::new().unwrap();
    write_inputs(dir.path());
    let config = EnvironmentConfig::from_yaml(yaml, "dev", dir.path()).unwrap();
    let workspace = RunWorkspace::create(&dir.path().join("state"), "dev", "test-run").unwrap();
    let ctx = Context {
        environment: "dev".to_string(),
        region: "us-east-1".to_string(),
        config: Arc::new(config),
        workspace,
        runner,
        cancel: CancellationToken::new(),
    };
    (ctx, dir)
}

pub fn context_with(runner: Arc<ScriptedRunner>) -> (Context, TempDir) {
    context_from_yaml(runner, FAST_CONFIG)
}

/// `kubectl get nodes -o json` with one node per `(ready, cordoned)` pair
pub fn nodes_json(nodes: &[(bool, bool)]) -> String {
    let items: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, (ready, cordoned))| {
            json!({
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": format!("ip-10-0-1-{}.ec2.internal", i + 10)},
                "spec": {"unschedulable": cordoned},
                "status": {"conditions": [
                    {"type": "MemoryPressure", "status": "False"},
                    {"type": "Ready", "status": if *ready { "True" } else { "False" }}
                ]}
            })
        })
        .collect();
    json!({"apiVersion": "v1", "kind": "List", "items": items}).to_string()
}

pub fn deployment_json(name: &str, ready: i32) -> String {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "locust"},
        "status": {"replicas": 3, "readyReplicas": ready}
    })
    .to_string()
}

/// The UI service, with a load-balancer hostname once one is assigned
pub fn service_json(hostname: Option<&str>) -> String {
    let status = match hostname {
        Some(h) => json!({"loadBalancer": {"ingress": [{"hostname": h}]}}),
        None => json!({"loadBalancer": {}}),
    };
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "locust-master", "namespace": "locust"},
        "spec": {
            "type": "LoadBalancer",
            "ports": [
                {"name": "web", "port": 8089, "targetPort": 8089},
                {"name": "comms", "port": 5557, "targetPort": 5557}
            ]
        },
        "status": status
    })
    .to_string()
}
