//! Error types for loadstack
//!
//! Errors carry structured fields (tool, operation, environment, handle name)
//! so the final report can name what failed and suggest a next command.
//! Severity is decided by callers: the process layer only reports what
//! happened, and each phase maps it onto one of these variants.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of an error, used for exit codes and the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Missing tool or credential; nothing has been touched yet
    Prerequisite,
    /// Another session holds the infrastructure state lock
    LockContention,
    /// The infrastructure tool reported failure; partial side effects possible
    Provisioning,
    /// A readiness wait ran out of time
    ReadinessTimeout,
    /// A collaborator reported success but an expected value is missing
    ContractViolation,
    /// Image build or push failed
    Publishing,
    /// Any other external command failure
    Command,
    /// Invalid configuration or arguments
    Configuration,
    /// Orchestrator bug or local I/O failure
    Internal,
    /// The operator interrupted the run
    Cancelled,
}

impl ErrorClass {
    /// Process exit code for a run that ended with this class of error.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorClass::Configuration => 2,
            ErrorClass::Prerequisite => 3,
            ErrorClass::LockContention => 4,
            ErrorClass::Provisioning => 5,
            ErrorClass::ReadinessTimeout => 6,
            ErrorClass::ContractViolation => 7,
            ErrorClass::Publishing => 8,
            ErrorClass::Command => 9,
            ErrorClass::Internal => 10,
            ErrorClass::Cancelled => 130,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Prerequisite => "PrerequisiteError",
            ErrorClass::LockContention => "LockContention",
            ErrorClass::Provisioning => "ProvisioningError",
            ErrorClass::ReadinessTimeout => "ReadinessTimeout",
            ErrorClass::ContractViolation => "ContractViolation",
            ErrorClass::Publishing => "PublishingError",
            ErrorClass::Command => "CommandError",
            ErrorClass::Configuration => "ConfigurationError",
            ErrorClass::Internal => "InternalError",
            ErrorClass::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Main error type for loadstack operations
#[derive(Debug, Error)]
pub enum Error {
    /// A required tool, credential or input file is missing
    #[error("prerequisite not met: {what}. {hint}")]
    Prerequisite {
        /// What is missing (tool name, credential, file)
        what: String,
        /// How the operator can fix it
        hint: String,
    },

    /// The remote state lock is held by another session
    #[error("state lock for environment '{environment}' is held by another session{}", .lock_id.as_deref().map(|id| format!(" (lock ID {})", id)).unwrap_or_default())]
    LockContention {
        /// Target environment
        environment: String,
        /// Lock ID reported by the infrastructure tool, when present
        lock_id: Option<String>,
        /// Raw tool output describing the lock holder
        detail: String,
    },

    /// The infrastructure tool reported a failure
    #[error("{operation} failed: {message}")]
    Provisioning {
        /// Operation that failed (init, plan, apply, destroy, ...)
        operation: String,
        /// Tail of the tool's error output
        message: String,
    },

    /// A wait for readiness exceeded its timeout
    #[error("timed out after {waited:?} waiting for {what}")]
    ReadinessTimeout {
        /// Description of the awaited condition
        what: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// A phase reported success but an expected output value is missing
    #[error("contract violation in {source_name}: {message}")]
    ContractViolation {
        /// Phase or collaborator that should have produced the value
        source_name: String,
        /// What was expected
        message: String,
    },

    /// A resource handle was bound twice with different values
    #[error("handle '{name}' is already bound to '{existing}', refusing to rebind to '{attempted}'")]
    HandleRebind {
        /// Logical handle name
        name: String,
        /// Value already bound
        existing: String,
        /// Value a later phase tried to bind
        attempted: String,
    },

    /// Image build or push failed
    #[error("{stage} failed: {message}")]
    Publishing {
        /// Publishing stage (authenticate, build, push, release)
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// A failure worth retrying (network hiccup, expired registry token)
    #[error("{operation} failed transiently: {message}")]
    Transient {
        /// Operation that failed
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// An external command exited unsuccessfully
    #[error("{command} failed{}: {message}", .exit_code.map(|c| format!(" with exit code {}", c)).unwrap_or_default())]
    Command {
        /// Command line that was run (program and arguments)
        command: String,
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Tail of the command's error output
        message: String,
    },

    /// An external command could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that could not be started
        program: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// An external command exceeded its deadline and was terminated
    #[error("{command} exceeded its deadline of {deadline:?} and was terminated")]
    CommandTimedOut {
        /// Command line that was run
        command: String,
        /// Deadline that was exceeded
        deadline: Duration,
    },

    /// The operator interrupted the run
    #[error("cancelled during {during}")]
    Cancelled {
        /// What was in progress
        during: String,
    },

    /// Invalid configuration or arguments
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a prerequisite error
    pub fn prerequisite(what: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Prerequisite {
            what: what.into(),
            hint: hint.into(),
        }
    }

    /// Create a provisioning error for the given operation
    pub fn provisioning(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a readiness timeout error
    pub fn readiness_timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::ReadinessTimeout {
            what: what.into(),
            waited,
        }
    }

    /// Create a contract violation error
    pub fn contract_violation(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ContractViolation {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a publishing error for the given stage
    pub fn publishing(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publishing {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create a transient (retryable) error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(during: impl Into<String>) -> Self {
        Self::Cancelled {
            during: during.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Classify this error for reporting and exit codes
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Prerequisite { .. } => ErrorClass::Prerequisite,
            Error::LockContention { .. } => ErrorClass::LockContention,
            Error::Provisioning { .. } => ErrorClass::Provisioning,
            Error::ReadinessTimeout { .. } => ErrorClass::ReadinessTimeout,
            Error::ContractViolation { .. } | Error::HandleRebind { .. } => {
                ErrorClass::ContractViolation
            }
            Error::Publishing { .. } => ErrorClass::Publishing,
            Error::Transient { .. }
            | Error::Command { .. }
            | Error::Spawn { .. }
            | Error::CommandTimedOut { .. } => ErrorClass::Command,
            Error::Cancelled { .. } => ErrorClass::Cancelled,
            Error::Configuration { .. } | Error::Yaml(_) => ErrorClass::Configuration,
            Error::Internal { .. } | Error::Io(_) | Error::Json(_) => ErrorClass::Internal,
        }
    }

    /// Whether a bounded automatic retry may help
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        self.class().exit_code()
    }
}
