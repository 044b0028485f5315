//! Runtime error taxonomy
//!
//! Compile-side errors live in `compiler::error`; these cover execution.
//! Cleanup (`collect` plus teardown) is unconditional regardless of category,
//! and no error path may carry a secret value into a log or artifact.

use crate::execution::driver::DriverError;
use crate::execution::events::TimeoutScope;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// A driver invocation failed past its retry budget
    #[error("Driver execution failed for step '{step}': {source}")]
    DriverExecution {
        step: String,
        #[source]
        source: DriverError,
    },

    /// Run- or step-scoped deadline exceeded; triggers forced collection
    #[error("Timed out ({scope:?})")]
    Timeout { scope: TimeoutScope },

    /// Transient provisioning failure; eligible for bounded retries
    #[error("Sandbox provisioning failed: {0}")]
    SandboxProvision(String),

    /// The control channel closed or produced garbage
    #[error("Control channel error: {0}")]
    Channel(String),

    /// Artifact retrieval or normalization failed
    #[error("Artifact collection failed: {0}")]
    Collect(String),

    /// Anything unexpected; always surfaced, never swallowed
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        RunError::Internal(err.to_string())
    }
}
