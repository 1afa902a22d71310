//! Error taxonomy for the orchestration core.
//!
//! Transient conditions carry a suggested delay. `Retryable` counts against
//! the task queue's retry budget; `Wait` is an expected wait and does not.

use std::time::Duration;

use shipwright_state::StorageError;

/// Shipwright core errors.
#[derive(Debug, thiserror::Error)]
pub enum ShipwrightError {
    #[error("retry in {}s: {reason}", delay.as_secs())]
    Retryable { delay: Duration, reason: String },

    #[error("waiting {}s: {reason}", delay.as_secs())]
    Wait { delay: Duration, reason: String },

    #[error("command failed with exit code {exit_code:?}: {command}\n{stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("merge conflict merging {commit} of {branch}")]
    MergeConflict {
        branch: String,
        commit: String,
        output: String,
    },

    #[error("git error: {0}")]
    Git(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipwrightError {
    pub fn retryable(delay: Duration, reason: impl Into<String>) -> Self {
        ShipwrightError::Retryable {
            delay,
            reason: reason.into(),
        }
    }

    pub fn wait(delay: Duration, reason: impl Into<String>) -> Self {
        ShipwrightError::Wait {
            delay,
            reason: reason.into(),
        }
    }

    /// Whether the task queue should reschedule instead of failing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShipwrightError::Retryable { .. } | ShipwrightError::Wait { .. }
        )
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            ShipwrightError::Retryable { delay, .. } | ShipwrightError::Wait { delay, .. } => {
                Some(*delay)
            }
            _ => None,
        }
    }

    /// Expected waits do not consume a retry attempt.
    pub fn ignores_retry_budget(&self) -> bool {
        matches!(self, ShipwrightError::Wait { .. })
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, ShipwrightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_variants_carry_delay() {
        let err = ShipwrightError::retryable(Duration::from_secs(20), "ssh handshake");
        assert!(err.is_transient());
        assert!(!err.ignores_retry_budget());
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(20)));

        let err = ShipwrightError::wait(Duration::from_secs(5), "lock held");
        assert!(err.is_transient());
        assert!(err.ignores_retry_budget());
        assert!(err.to_string().contains("lock held"));
    }

    #[test]
    fn fatal_variants_are_not_transient() {
        let err = ShipwrightError::CommandFailed {
            command: "false".into(),
            exit_code: Some(1),
            stderr: String::new(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.retry_delay(), None);
    }

    #[test]
    fn storage_error_converts() {
        let err: ShipwrightError = StorageError::Invariant("two new items".into()).into();
        assert!(err.to_string().contains("two new items"));
    }
}
