//! Per-run working directory
//!
//! Layout under `<state-dir>/runs/<environment>/<run-id>/`:
//! `run.log`, `tfplan`, `plan.json`, `kubeconfig`, `rendered/`,
//! `handles.json`, `report.json`.

use std::path::{Path, PathBuf};

use loadstack_common::Result;

/// Generate a short readable run ID: UTC timestamp plus 6 hex chars.
///
/// The suffix combines the clock and the process ID so two runs started in
/// the same second still get distinct directories.
pub fn generate_run_id() -> String {
    let now = chrono::Utc::now();
    let millis = now.timestamp_millis() as u32;
    let pid = std::process::id();
    format!(
        "{}-{:06x}",
        now.format("%Y%m%dT%H%M%SZ"),
        (millis ^ pid) & 0xFFFFFF
    )
}

/// Directory holding everything one run produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    root: PathBuf,
    run_id: String,
}

impl RunWorkspace {
    /// Create `<state_dir>/runs/<environment>/<run_id>/` and its `rendered/` child
    pub fn create(state_dir: &Path, environment: &str, run_id: &str) -> Result<Self> {
        let state_dir = if state_dir.is_absolute() {
            state_dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(state_dir)
        };
        let root = state_dir.join("runs").join(environment).join(run_id);
        std::fs::create_dir_all(root.join("rendered"))?;
        Ok(Self {
            root,
            run_id: run_id.to_string(),
        })
    }

    /// Run identifier
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Workspace directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-run JSON log
    pub fn log_path(&self) -> PathBuf {
        self.root.join("run.log")
    }

    /// Saved Terraform plan
    pub fn plan_file(&self) -> PathBuf {
        self.root.join("tfplan")
    }

    /// Machine-readable change plan
    pub fn plan_json(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    /// Kubeconfig written for this run only
    pub fn kubeconfig(&self) -> PathBuf {
        self.root.join("kubeconfig")
    }

    /// Rendered manifests
    pub fn rendered_dir(&self) -> PathBuf {
        self.root.join("rendered")
    }

    /// Resource handle summary
    pub fn handles_json(&self) -> PathBuf {
        self.root.join("handles.json")
    }

    /// Final report
    pub fn report_json(&self) -> PathBuf {
        self.root.join("report.json")
    }
}
