use std::sync::Arc;
use thiserror::Error;

/// Error type shared by every runner, handle and stream in the workspace.
///
/// The type is `Clone` because one exit outcome is fanned out to every
/// concurrent `join()` caller.
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    #[error("Could not start process: {0}")]
    StartFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Process ended unexpectedly")]
    EndedUnexpectedly,

    #[error("Failed to read exit code: {0}")]
    ExitCodeUnavailable(String),

    #[error("The process was killed")]
    Killed,

    #[error("Terminating process failed: {0}")]
    KillFailed(String),

    #[error("{0}")]
    Unsupported(&'static str),

    #[error("Sending signal {signo} failed: {reason}")]
    Signal { signo: i32, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Stream has already been closed")]
    StreamClosed,

    #[error("A read operation is already pending on this stream")]
    PendingRead,

    #[error("Failed to launch process: {0}")]
    LaunchFailed(Box<ProcessError>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ProcessError {
    fn from(error: std::io::Error) -> Self {
        ProcessError::Io(Arc::new(error))
    }
}

impl ProcessError {
    /// True when the outcome was forced by `kill()` rather than reported by the process.
    pub fn is_killed(&self) -> bool {
        matches!(self, ProcessError::Killed)
    }

    /// True for errors that can only surface from `start()`.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            ProcessError::StartFailed(_) | ProcessError::Handshake(_)
        )
    }

    /// Wraps the error the way a deferred stream reports a failed resolution.
    pub fn launch_failed(self) -> Self {
        match self {
            already @ ProcessError::LaunchFailed(_) => already,
            other => ProcessError::LaunchFailed(Box::new(other)),
        }
    }
}

pub type Result<T, E = ProcessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ProcessError::Killed.to_string(), "The process was killed");
        assert_eq!(
            ProcessError::EndedUnexpectedly.to_string(),
            "Process ended unexpectedly"
        );

        let error = ProcessError::StartFailed("Could not determine PID".to_string());
        assert!(error.to_string().contains("Could not determine PID"));
    }

    #[test]
    fn test_error_categorization() {
        assert!(ProcessError::Killed.is_killed());
        assert!(!ProcessError::EndedUnexpectedly.is_killed());

        assert!(ProcessError::StartFailed("x".into()).is_start_failure());
        assert!(ProcessError::Handshake("x".into()).is_start_failure());
        assert!(!ProcessError::Cancelled.is_start_failure());
    }

    #[test]
    fn test_launch_failed_does_not_nest() {
        let error = ProcessError::StartFailed("boom".into()).launch_failed();
        let again = error.clone().launch_failed();
        match again {
            ProcessError::LaunchFailed(inner) => {
                assert!(matches!(*inner, ProcessError::StartFailed(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let error: ProcessError = std::io::Error::other("pipe broke").into();
        let cloned = error.clone();
        assert!(cloned.to_string().contains("pipe broke"));
    }
}
