//! Common building blocks for loadstack: errors, polling, process invocation,
//! retry, resource handles and the session model.

#![deny(missing_docs)]

pub mod error;
pub mod handles;
pub mod poll;
pub mod process;
pub mod retry;
pub mod session;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, ErrorClass};
pub use handles::HandleRegistry;
pub use poll::{wait_for, wait_for_value, WaitCondition, WaitOutcome};
pub use process::{Invocation, ProcessOutput, ProcessRunner, SystemRunner, Termination};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable that skips the interactive teardown confirmation
pub const ASSUME_YES_ENV: &str = "LOADSTACK_ASSUME_YES";
