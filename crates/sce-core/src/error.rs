//! Typed error taxonomy.
//!
//! Every user-visible failure is one of these classes; the machine name is
//! stable and appears verbatim in JSON output.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing/empty required fields, unknown enum values, mutually
    /// exclusive options.
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// Stage prerequisite unmet or a forbidden status transition.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Lock held by another non-stale owner, or an incompatible merge.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Verify/release gate failed or the errorbook release gate blocked.
    #[error("gate blocked: {reason}")]
    GateBlock {
        reason: String,
        blockers: Vec<String>,
    },

    /// Missing or invalid password for a privileged studio transition.
    /// Never mutates state.
    #[error("authorization failed: {0}")]
    AuthorizationFailure(String),

    /// Retries exhausted against upstream rate limiting.
    #[error("rate limit fatal: {0}")]
    RateLimitFatal(String),

    /// Registry source or index fetch failed.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Malformed persisted JSON that has no defined fallback.
    #[error("corrupt state: {0}")]
    Corruption(String),

    /// Filesystem failure underneath the state store.
    #[error("io: {0}")]
    Io(String),
}

impl CoreError {
    /// Stable machine name surfaced in JSON output.
    pub fn machine_name(&self) -> &'static str {
        match self {
            CoreError::InputValidation(_) => "input-validation",
            CoreError::PreconditionViolation(_) => "precondition-violation",
            CoreError::NotFound(_) => "not-found",
            CoreError::Conflict(_) => "conflict",
            CoreError::GateBlock { .. } => "gate-block",
            CoreError::AuthorizationFailure(_) => "authorization-failure",
            CoreError::RateLimitFatal(_) => "rate-limit-fatal",
            CoreError::RegistryUnavailable(_) => "registry-unavailable",
            CoreError::Corruption(_) => "corruption",
            CoreError::Io(_) => "io",
        }
    }

    pub fn gate_block(reason: impl Into<String>, blockers: Vec<String>) -> Self {
        CoreError::GateBlock {
            reason: reason.into(),
            blockers,
        }
    }

    pub(crate) fn io(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        CoreError::Io(format!("{context}: {err}"))
    }

    pub(crate) fn corrupt(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        CoreError::Corruption(format!("{context}: {err}"))
    }
}
