// packages/kernel/src/utils/errors.rs
//! Kernel error types
//!
//! Only failures in the kernel's own bookkeeping surface as [`KernelError`].
//! Failures raised by agent hooks or wakeups are isolated, reported and never
//! returned to callers.

use crate::lifecycle::State;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

/// Result alias used throughout the kernel
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors surfaced by the kernel
#[derive(Debug, Error)]
pub enum KernelError {
    /// A lifecycle operation was invoked from the wrong state
    #[error("cannot {operation} agent '{agent}': expected state {expected}, found {actual}")]
    IllegalState {
        agent: String,
        operation: &'static str,
        expected: State,
        actual: State,
    },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to spawn kernel thread: {0}")]
    ThreadSpawnFailed(#[from] std::io::Error),

    #[error("observability setup failed: {0}")]
    ObservabilityError(String),

    /// The scheduler was shut down and no longer accepts work
    #[error("scheduler is shut down")]
    SchedulerShutdown,
}

impl From<config::ConfigError> for KernelError {
    fn from(err: config::ConfigError) -> Self {
        KernelError::ConfigError(err.to_string())
    }
}

impl KernelError {
    /// Whether this error signals a caller programming error
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, KernelError::IllegalState { .. })
    }
}

/// Run an agent-supplied callback, turning a panic into an error
pub(crate) fn guarded<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("panicked: {}", message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_state_display() {
        let err = KernelError::IllegalState {
            agent: "mailer".to_string(),
            operation: "stop",
            expected: State::Running,
            actual: State::Stopped,
        };
        assert!(err.is_illegal_state());
        assert_eq!(
            err.to_string(),
            "cannot stop agent 'mailer': expected state RUNNING, found STOPPED"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let err: KernelError = config::ConfigError::Message("bad value".into()).into();
        assert!(matches!(err, KernelError::ConfigError(_)));
        assert!(!err.is_illegal_state());
    }

    #[test]
    fn test_guarded_passes_through_results() {
        assert!(guarded(|| Ok(())).is_ok());
        let err = guarded(|| Err(anyhow::anyhow!("disk full"))).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_guarded_catches_panics() {
        let err = guarded(|| panic!("boom")).unwrap_err();
        assert_eq!(err.to_string(), "panicked: boom");

        let code = 7;
        let err = guarded(|| panic!("exit code {}", code)).unwrap_err();
        assert_eq!(err.to_string(), "panicked: exit code 7");
    }
}
