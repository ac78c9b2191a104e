//! Resource handle registry
//!
//! Logical names (`cluster_name`, `registry_url`, ...) resolved to the external
//! identifiers earlier phases produced. A handle is bound once; later phases
//! read it through [`HandleRegistry::require`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// EKS cluster name (infrastructure output)
pub const CLUSTER_NAME: &str = "cluster_name";
/// ECR repository URL (infrastructure output)
pub const REGISTRY_URL: &str = "registry_url";
/// VPC identifier (infrastructure output)
pub const VPC_ID: &str = "vpc_id";
/// AWS account of the caller identity
pub const ACCOUNT_ID: &str = "account_id";
/// Fully qualified pushed image reference
pub const IMAGE_REFERENCE: &str = "image_reference";
/// Address of the Locust web UI load balancer
pub const LOCUST_UI_ENDPOINT: &str = "locust_ui_endpoint";

/// A bound handle value and the phase that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// External identifier
    pub value: String,
    /// Phase or collaborator that bound it
    pub source: String,
}

/// Immutable-once-bound mapping of logical names to external identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleRegistry {
    bindings: BTreeMap<String, Binding>,
}

impl HandleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`.
    ///
    /// Binding the same value again is a no-op. Binding a different value, or
    /// an empty one, is an error and leaves the registry unchanged.
    pub fn bind(&mut self, name: &str, value: &str, source: &str) -> Result<()> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::contract_violation(
                source,
                format!("produced an empty value for '{}'", name),
            ));
        }

        match self.bindings.get(name) {
            Some(existing) if existing.value == value => Ok(()),
            Some(existing) => Err(Error::HandleRebind {
                name: name.to_string(),
                existing: existing.value.clone(),
                attempted: value.to_string(),
            }),
            None => {
                debug!(handle = %name, value = %value, source = %source, "Bound resource handle");
                self.bindings.insert(
                    name.to_string(),
                    Binding {
                        value: value.to_string(),
                        source: source.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Value of `name`, if bound
    pub fn get(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(|b| b.value.as_str())
    }

    /// Full binding of `name`, if bound
    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    /// Value of `name`, or a contract violation naming the consumer
    pub fn require(&self, name: &str, consumer: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            Error::contract_violation(
                consumer,
                format!("required handle '{}' is not bound", name),
            )
        })
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Name → value view for reports
    pub fn summary(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .map(|(k, b)| (k.clone(), b.value.clone()))
            .collect()
    }

    /// Write the summary as pretty JSON for follow-on pipelines
    pub fn write_summary(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.summary())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
