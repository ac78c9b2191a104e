//! Scripted collaborators and on-disk inputs for the end-to-end scenarios

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use loadstack_cli::config::EnvironmentConfig;
use loadstack_cli::context::Context;
use loadstack_cli::teardown::Confirmer;
use loadstack_cli::workspace::RunWorkspace;
use loadstack_common::testing::{fail, ok, ScriptedRunner};
use loadstack_common::Result;

pub const REGISTRY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com/loadstack-dev-locust";

const CONFIG: &str = "\
region: us-east-1
terraform:
  backend:
    bucket: acme-tf-state
    dynamodb_table: acme-tf-locks
cluster:
  min_ready_nodes: 2
  ready_timeout_secs: 30
  poll_interval_secs: 5
workload:
  worker_replicas: 3
  ready_timeout_secs: 60
  poll_interval_secs: 5
  endpoint_timeout_secs: 30
teardown:
  eni_timeout_secs: 120
  eni_poll_interval_secs: 10
";

const MASTER: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata: {name: locust-master, namespace: '${NAMESPACE}'}
spec:
  replicas: 1
  template:
    spec:
      containers:
        - {name: locust, image: '${IMAGE}', args: ['--master']}
";

const WORKER: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata: {name: locust-worker, namespace: '${NAMESPACE}'}
spec:
  replicas: ${WORKER_REPLICAS}
  template:
    spec:
      containers:
        - name: locust
          image: '${IMAGE}'
          env: [{name: LOCUST_SCENARIO, value: '${SCENARIO}'}, {name: STACK, value: '${ENVIRONMENT}'}]
";

const SERVICE: &str = "\
apiVersion: v1
kind: Service
metadata: {name: locust-master, namespace: '${NAMESPACE}'}
spec:
  type: LoadBalancer
  ports: [{name: web, port: 8089}]
";

pub const IDENTITY: &str = r#"{"UserId":"AIDAEXAMPLE","Account":"123456789012","Arn":"arn:aws:iam::123456789012:user/ci"}"#;

pub const PLAN_JSON: &str = r#"{"format_version":"1.2","resource_changes":[
    {"address":"module.vpc.aws_vpc.this[0]","change":{"actions":["create"]}},
    {"address":"module.eks.aws_eks_cluster.this[0]","change":{"actions":["create"]}},
    {"address":"aws_ecr_repository.locust","change":{"actions":["create"]}}
]}"#;

pub const LOCK_ERROR: &str = "\
Error: Error acquiring the state lock

Lock Info:
  ID:        0d7c5a1e-1111-2222-3333-444455556666
  Path:      acme-tf-state/loadstack/dev/terraform.tfstate
  Operation: OperationTypeApply
  Who:       alice@laptop
";

const PUSH_OK: &str = "The push refers to repository\n\
    abc123: digest: sha256:4d2c1f0e9b8a7f6e5d4c3b2a19080706050403020100ffeeddccbbaa99887766 size: 1570\n";

pub fn tf_outputs() -> String {
    let out = |v: &str| json!({"sensitive": false, "type": "string", "value": v});
    json!({
        "cluster_name": out("loadstack-dev"),
        "ecr_repository_url": out(REGISTRY),
        "vpc_id": out("vpc-0abc"),
    })
    .to_string()
}

pub fn nodes(ready: usize) -> String {
    let items: Vec<_> = (0..ready)
        .map(|i| {
            json!({
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": format!("node-{}", i)},
                "status": {"conditions": [{"type": "Ready", "status": "True"}]}
            })
        })
        .collect();
    json!({"apiVersion": "v1", "kind": "List", "items": items}).to_string()
}

pub fn deployment(name: &str, ready: i32) -> String {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name},
        "status": {"readyReplicas": ready}
    })
    .to_string()
}

pub fn ui_service() -> String {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "locust-master", "namespace": "locust"},
        "spec": {"type": "LoadBalancer", "ports": [{"name": "web", "port": 8089}]},
        "status": {
            "loadBalancer": {"ingress": [{"hostname": "k8s-locust.elb.us-east-1.amazonaws.com"}]}
        }
    })
    .to_string()
}

pub fn network_interfaces(load_balancer: bool) -> String {
    let items = if load_balancer {
        json!([{
            "NetworkInterfaceId": "eni-0lb",
            "Description": "ELB net/k8s-locust/abc",
            "InterfaceType": "network_load_balancer"
        }])
    } else {
        json!([{
            "NetworkInterfaceId": "eni-0node",
            "Description": "aws-K8S-i-0123",
            "InterfaceType": "interface"
        }])
    };
    json!({"NetworkInterfaces": items}).to_string()
}

/// Input files for environment `dev` plus a state directory
pub struct Inputs {
    pub dir: TempDir,
    config: EnvironmentConfig,
}

impl Inputs {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("terraform/environments")).unwrap();
        let tfvars = root.join("terraform/environments/dev.tfvars");
        std::fs::write(tfvars, "environment = \"dev\"\n").unwrap();
        std::fs::create_dir_all(root.join("k8s")).unwrap();
        std::fs::write(root.join("k8s/master.yaml"), MASTER).unwrap();
        std::fs::write(root.join("k8s/service.yaml"), SERVICE).unwrap();
        std::fs::write(root.join("k8s/worker.yaml"), WORKER).unwrap();
        std::fs::write(root.join("Dockerfile"), "FROM locustio/locust\n").unwrap();

        let config = EnvironmentConfig::from_yaml(CONFIG, "dev", root).unwrap();
        Self { dir, config }
    }

    /// A fresh run against the same inputs
    pub fn context(&self, runner: Arc<ScriptedRunner>, run_id: &str) -> Context {
        Context {
            environment: "dev".to_string(),
            region: "us-east-1".to_string(),
            config: Arc::new(self.config.clone()),
            workspace: RunWorkspace::create(&self.dir.path().join("state"), "dev", run_id).unwrap(),
            runner,
            cancel: CancellationToken::new(),
        }
    }
}

/// Every collaborator answers as a healthy AWS account would
pub fn healthy_runner() -> Arc<ScriptedRunner> {
    let runner = Arc::new(ScriptedRunner::new());
    runner
        .on("which", &[], ok("/usr/local/bin/tool"))
        .on("aws", &["sts", "get-caller-identity"], ok(IDENTITY))
        .on("docker", &["info"], ok("27.0.1"))
        .on("terraform", &["init"], ok("Terraform has been successfully initialized!"))
        .on("terraform", &["validate"], ok("Success!"))
        .on("terraform", &["plan"], fail(2, ""))
        .on("terraform", &["show", "-json"], ok(PLAN_JSON))
        .on("terraform", &["apply"], ok("Apply complete! Resources: 3 added."))
        .on("terraform", &["output", "-json"], ok(&tf_outputs()))
        .on("terraform", &["destroy"], ok("Destroy complete!"))
        .on("aws", &["eks", "update-kubeconfig"], ok("Added new context"))
        .on("kubectl", &["get", "nodes"], ok(&nodes(2)))
        .on("aws", &["ecr", "get-login-password"], ok("token"))
        .on("aws", &["ecr", "delete-repository"], ok("{}"))
        .on("docker", &["login"], ok("Login Succeeded"))
        .on("docker", &["build"], ok(""))
        .on("docker", &["image", "inspect"], ok("sha256:0f0e0d"))
        .on("docker", &["tag"], ok(""))
        .on("docker", &["push"], ok(PUSH_OK))
        .on("kubectl", &["apply", "--server-side"], ok("namespace/locust serverside-applied"))
        .on(
            "kubectl",
            &["apply", "-n"],
            ok("deployment.apps/locust-master\nservice/locust-master\ndeployment.apps/locust-worker\n"),
        )
        .on("kubectl", &["get", "deployment", "locust-master"], ok(&deployment("locust-master", 1)))
        .on("kubectl", &["get", "deployment", "locust-worker"], ok(&deployment("locust-worker", 3)))
        .on("kubectl", &["get", "service", "locust-master"], ok(&ui_service()))
        .on(
            "kubectl",
            &["get", "services", "--all-namespaces"],
            ok(&format!(r#"{{"apiVersion":"v1","kind":"List","items":[{}]}}"#, ui_service())),
        )
        .on("kubectl", &["delete"], ok(""))
        .on("aws", &["ec2", "describe-network-interfaces"], ok(&network_interfaces(false)));
    runner
}

/// Replays canned answers to the confirmation prompts
pub struct Answers(Mutex<Vec<&'static str>>);

impl Answers {
    pub fn new(answers: &[&'static str]) -> Self {
        Self(Mutex::new(answers.iter().rev().copied().collect()))
    }
}

#[async_trait]
impl Confirmer for Answers {
    async fn ask(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.lock().unwrap().pop().unwrap_or_default().to_string())
    }
}
