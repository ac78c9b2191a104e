//! Per-environment orchestrator settings loaded from `<config-dir>/<environment>.yaml`.
//!
//! Every section is optional and falls back to defaults. Relative paths are
//! resolved against the directory loadstack is started from, so the same
//! file works whichever tool ends up reading the path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use loadstack_common::handles::{CLUSTER_NAME, REGISTRY_URL, VPC_ID};
use loadstack_common::{Error, Result};

/// Locust scenario selected for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// JSONPlaceholder REST API
    #[default]
    Jsonplaceholder,
    /// httpbin request/response service
    Httpbin,
    /// User-supplied scenario baked into the image
    Custom,
}

impl Scenario {
    /// Value injected into the manifests
    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::Jsonplaceholder => "jsonplaceholder",
            Scenario::Httpbin => "httpbin",
            Scenario::Custom => "custom",
        }
    }
}

/// Workload kind whose replicas are checked for readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl WorkloadKind {
    /// Resource name as understood by kubectl
    pub fn resource(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        }
    }
}

/// A workload that must reach a minimum number of ready replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessTarget {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Workload name
    pub name: String,
    /// Minimum ready replicas
    pub min_ready: u32,
}

/// Root of `<environment>.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Default region when neither `--region` nor `AWS_REGION` is set
    pub region: Option<String>,
    /// Prefix for locally built image names
    pub project: String,
    /// Infrastructure settings
    pub terraform: TerraformConfig,
    /// Cluster capacity settings
    pub cluster: ClusterConfig,
    /// Image build and push settings
    pub image: ImageConfig,
    /// Locust workload settings
    pub workload: WorkloadConfig,
    /// Teardown settings
    pub teardown: TeardownConfig,
    /// Optional deadlines for long-running commands, in seconds
    pub deadlines: DeadlineConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            region: None,
            project: "loadstack".to_string(),
            terraform: TerraformConfig::default(),
            cluster: ClusterConfig::default(),
            image: ImageConfig::default(),
            workload: WorkloadConfig::default(),
            teardown: TeardownConfig::default(),
            deadlines: DeadlineConfig::default(),
        }
    }
}

/// Terraform root module, parameter file and remote state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerraformConfig {
    /// Root module directory
    pub dir: PathBuf,
    /// Parameter file; defaults to `<dir>/environments/<environment>.tfvars`
    pub var_file: Option<PathBuf>,
    /// Seconds Terraform waits for the state lock
    pub lock_timeout_secs: u64,
    /// Remote state backend; omitted means the module's own backend block
    pub backend: Option<BackendConfig>,
    /// Handle name → Terraform output name
    pub outputs: BTreeMap<String, String>,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        let outputs = [
            (CLUSTER_NAME, "cluster_name"),
            (REGISTRY_URL, "ecr_repository_url"),
            (VPC_ID, "vpc_id"),
        ]
        .into_iter()
        .map(|(h, o)| (h.to_string(), o.to_string()))
        .collect();
        Self {
            dir: PathBuf::from("terraform"),
            var_file: None,
            lock_timeout_secs: 300,
            backend: None,
            outputs,
        }
    }
}

/// S3 state bucket and DynamoDB lock table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// State bucket
    pub bucket: String,
    /// Key prefix; the state key is `<prefix>/<environment>/terraform.tfstate`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Lock table
    pub dynamodb_table: String,
    /// Bucket region, when different from the deployment region
    #[serde(default)]
    pub region: Option<String>,
}

fn default_key_prefix() -> String {
    "loadstack".to_string()
}

impl BackendConfig {
    /// State object key for `environment`
    pub fn state_key(&self, environment: &str) -> String {
        format!(
            "{}/{}/terraform.tfstate",
            self.key_prefix.trim_end_matches('/'),
            environment
        )
    }
}

/// Node capacity required before anything is deployed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Ready, schedulable nodes required
    pub min_ready_nodes: u32,
    /// Seconds to wait for them
    pub ready_timeout_secs: u64,
    /// Seconds between checks
    pub poll_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_ready_nodes: 2,
            ready_timeout_secs: 900,
            poll_interval_secs: 15,
        }
    }
}

/// Image build inputs and push behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// Build context
    pub context: PathBuf,
    /// Dockerfile, relative to the working directory
    pub dockerfile: PathBuf,
    /// Local image name; defaults to `<project>-locust`
    pub local_name: Option<String>,
    /// Push attempts, including the first
    pub push_attempts: u32,
    /// Seconds a registry login stays trusted
    pub auth_max_age_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            context: PathBuf::from("."),
            dockerfile: PathBuf::from("Dockerfile"),
            local_name: None,
            push_attempts: 4,
            auth_max_age_secs: 6 * 3600,
        }
    }
}

/// Locust coordinator and worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Manifest templates
    pub manifests_dir: PathBuf,
    /// Namespace the workload runs in
    pub namespace: String,
    /// Locust scenario
    pub scenario: Scenario,
    /// Declared worker replicas
    pub worker_replicas: u32,
    /// Readiness targets; defaults to coordinator 1 and workers `worker_replicas`
    pub targets: Vec<ReadinessTarget>,
    /// Seconds to wait for readiness
    pub ready_timeout_secs: u64,
    /// Seconds between readiness checks
    pub poll_interval_secs: u64,
    /// LoadBalancer service exposing the Locust UI
    pub ui_service: Option<String>,
    /// Seconds to wait for the UI address
    pub endpoint_timeout_secs: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            manifests_dir: PathBuf::from("k8s"),
            namespace: "locust".to_string(),
            scenario: Scenario::default(),
            worker_replicas: 3,
            targets: Vec::new(),
            ready_timeout_secs: 600,
            poll_interval_secs: 10,
            ui_service: Some("locust-master".to_string()),
            endpoint_timeout_secs: 300,
        }
    }
}

impl WorkloadConfig {
    /// Configured readiness targets, or the coordinator/worker defaults
    pub fn readiness_targets(&self) -> Vec<ReadinessTarget> {
        if !self.targets.is_empty() {
            return self.targets.clone();
        }
        vec![
            ReadinessTarget {
                kind: WorkloadKind::Deployment,
                name: "locust-master".to_string(),
                min_ready: 1,
            },
            ReadinessTarget {
                kind: WorkloadKind::Deployment,
                name: "locust-worker".to_string(),
                min_ready: self.worker_replicas,
            },
        ]
    }
}

/// Teardown waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeardownConfig {
    /// Seconds to wait for load-balancer network interfaces to go away
    pub eni_timeout_secs: u64,
    /// Seconds between network interface checks
    pub eni_poll_interval_secs: u64,
    /// Seconds kubectl waits for deletions
    pub delete_timeout_secs: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            eni_timeout_secs: 900,
            eni_poll_interval_secs: 15,
            delete_timeout_secs: 300,
        }
    }
}

/// Optional per-command deadlines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeadlineConfig {
    /// terraform apply
    pub apply_secs: Option<u64>,
    /// terraform destroy
    pub destroy_secs: Option<u64>,
    /// docker build
    pub build_secs: Option<u64>,
    /// each docker push attempt
    pub push_secs: Option<u64>,
}

impl DeadlineConfig {
    /// Deadline for `terraform apply`
    pub fn apply(&self) -> Option<Duration> {
        self.apply_secs.map(Duration::from_secs)
    }

    /// Deadline for `terraform destroy`
    pub fn destroy(&self) -> Option<Duration> {
        self.destroy_secs.map(Duration::from_secs)
    }

    /// Deadline for `docker build`
    pub fn build(&self) -> Option<Duration> {
        self.build_secs.map(Duration::from_secs)
    }

    /// Deadline for a single `docker push`
    pub fn push(&self) -> Option<Duration> {
        self.push_secs.map(Duration::from_secs)
    }
}

impl EnvironmentConfig {
    /// Load `<config_dir>/<environment>.yaml`, or defaults when it is absent.
    pub fn load(config_dir: &Path, environment: &str) -> Result<Self> {
        validate_environment_name(environment)?;
        let base = std::env::current_dir()?;
        let path = config_dir.join(format!("{}.yaml", environment));

        if !path.exists() {
            debug!(path = %path.display(), "No environment config file, using defaults");
            let mut config = Self::default();
            config.resolve(&base, environment);
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content, environment, &base).map_err(|e| match e {
            Error::Yaml(inner) => {
                Error::configuration(format!("failed to parse {}: {}", path.display(), inner))
            }
            other => other,
        })
    }

    /// Parse and validate a config document, resolving paths against `base`.
    pub fn from_yaml(content: &str, environment: &str, base: &Path) -> Result<Self> {
        let mut config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.resolve(base, environment);
        config.validate()?;
        Ok(config)
    }

    fn resolve(&mut self, base: &Path, environment: &str) {
        let absolute = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };

        self.terraform.dir = absolute(&self.terraform.dir);
        let var_file = self
            .terraform
            .var_file
            .take()
            .map(|p| absolute(&p))
            .unwrap_or_else(|| {
                self.terraform
                    .dir
                    .join("environments")
                    .join(format!("{}.tfvars", environment))
            });
        self.terraform.var_file = Some(var_file);
        self.image.context = absolute(&self.image.context);
        self.image.dockerfile = absolute(&self.image.dockerfile);
        self.workload.manifests_dir = absolute(&self.workload.manifests_dir);
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.terraform.lock_timeout_secs == 0 {
            return Err(Error::configuration("terraform.lock_timeout_secs must be positive"));
        }
        for handle in [CLUSTER_NAME, REGISTRY_URL, VPC_ID] {
            if !self.terraform.outputs.contains_key(handle) {
                return Err(Error::configuration(format!(
                    "terraform.outputs must map the '{}' handle",
                    handle
                )));
            }
        }
        if self.cluster.min_ready_nodes == 0 {
            return Err(Error::configuration("cluster.min_ready_nodes must be at least 1"));
        }
        check_wait(
            "cluster",
            self.cluster.poll_interval_secs,
            self.cluster.ready_timeout_secs,
        )?;
        check_wait(
            "workload",
            self.workload.poll_interval_secs,
            self.workload.ready_timeout_secs,
        )?;
        check_wait(
            "workload endpoint",
            self.workload.poll_interval_secs,
            self.workload.endpoint_timeout_secs,
        )?;
        check_wait(
            "teardown",
            self.teardown.eni_poll_interval_secs,
            self.teardown.eni_timeout_secs,
        )?;
        if self.image.push_attempts == 0 {
            return Err(Error::configuration("image.push_attempts must be at least 1"));
        }
        if self.workload.namespace.trim().is_empty() {
            return Err(Error::configuration("workload.namespace must not be empty"));
        }
        let targets = self.workload.readiness_targets();
        if let Some(t) = targets.iter().find(|t| t.name.trim().is_empty()) {
            return Err(Error::configuration(format!(
                "readiness target of kind {:?} has an empty name",
                t.kind
            )));
        }
        if let Some(t) = targets.iter().find(|t| t.min_ready == 0) {
            return Err(Error::configuration(format!(
                "readiness target '{}' must require at least one ready replica",
                t.name
            )));
        }
        Ok(())
    }

    /// Parameter file passed to Terraform
    pub fn var_file(&self) -> PathBuf {
        self.terraform
            .var_file
            .clone()
            .unwrap_or_else(|| self.terraform.dir.join("terraform.tfvars"))
    }

    /// Local image name used for build and tag
    pub fn local_image_name(&self) -> String {
        self.image
            .local_name
            .clone()
            .unwrap_or_else(|| format!("{}-locust", self.project))
    }
}

fn check_wait(section: &str, interval: u64, timeout: u64) -> Result<()> {
    if interval == 0 || timeout <= interval {
        return Err(Error::configuration(format!(
            "{} poll interval ({}s) must be positive and shorter than its timeout ({}s)",
            section, interval, timeout
        )));
    }
    Ok(())
}

/// Environment names become state keys, kubeconfig aliases and namespaces.
pub fn validate_environment_name(environment: &str) -> Result<()> {
    let valid = !environment.is_empty()
        && environment.len() <= 32
        && environment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !environment.starts_with('-')
        && !environment.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "invalid environment name '{}': use 1-32 lowercase letters, digits or '-'",
            environment
        )))
    }
}
