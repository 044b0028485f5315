//! Compile error taxonomy
//!
//! Every variant carries enough location detail for the caller to point back
//! into the offending spec; compile errors are never retried.

use thiserror::Error;

/// Errors produced while turning a spec into a manifest
#[derive(Debug, Error)]
pub enum CompileError {
    /// Bad spec shape; the caller can edit the input and recompile
    #[error("Validation error at {pointer}: {message}")]
    Validation { pointer: String, message: String },

    /// A `${params.*}` placeholder survived substitution
    #[error("Unresolved parameter '{name}' at {pointer}")]
    UnresolvedParam { name: String, pointer: String },

    /// A literal value appeared under a secret key in the spec
    #[error("Inline secret value forbidden: step '{step}' key '{key}'")]
    SecretInlineForbidden { step: String, key: String },

    /// The needs graph is not acyclic
    #[error("Dependency cycle detected involving step '{step}'")]
    CycleDetected { step: String },

    #[error("Internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    /// Process exit status for the compile surface:
    /// 2 for input errors the caller can fix, 1 for internal faults.
    pub fn exit_code(&self) -> i32 {
        match self {
            CompileError::Internal(_) => 1,
            _ => 2,
        }
    }

    /// Stable category label used in reports
    pub fn category(&self) -> &'static str {
        match self {
            CompileError::Validation { .. } => "validation",
            CompileError::UnresolvedParam { .. } => "unresolved_param",
            CompileError::SecretInlineForbidden { .. } => "secret_inline_forbidden",
            CompileError::CycleDetected { .. } => "cycle_detected",
            CompileError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let user = CompileError::UnresolvedParam {
            name: "x".to_string(),
            pointer: "/steps/0".to_string(),
        };
        assert_eq!(user.exit_code(), 2);
        assert_eq!(CompileError::Internal("boom".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_categories() {
        let err = CompileError::SecretInlineForbidden {
            step: "notify".to_string(),
            key: "token".to_string(),
        };
        assert_eq!(err.category(), "secret_inline_forbidden");
        assert!(err.to_string().contains("notify"));
    }
}
