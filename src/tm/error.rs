//! Error types used by the supervisor.
//!
//! One sum type covers the whole taxonomy: configuration rejection, spawn
//! and lifecycle failures, and operator input errors. Program operations
//! return these; the controller logs them with the program name and keeps
//! its command loop alive.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Validation failure during initial parse or reload.
    ///
    /// Initial parse failures are fatal; reload failures reject the reload
    /// and keep the previous snapshot.
    #[error("{subject}: invalid configuration: {message}")]
    InvalidConfig {
        /// Program name, or the config path for file-level failures.
        subject: String,
        message: String,
    },

    /// Fork/exec failure while launching a child.
    ///
    /// Counted as a failed attempt inside `start`; escalates to
    /// [`SupervisorError::StartExhausted`] once the attempt budget is spent.
    #[error("{program}: failed to spawn child: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// `start` did not reach fully-running within its attempt budget.
    #[error("{program}: maximum restart attempts reached after {attempts} attempts")]
    StartExhausted { program: String, attempts: u32 },

    /// Sending the stop signal failed with something other than
    /// no-such-process. Escalated to SIGKILL by the caller.
    #[error("{program}: failed to stop pid {pid}: {message}")]
    StopFailed {
        program: String,
        pid: i32,
        message: String,
    },

    /// Operator command referenced an unknown program.
    #[error("program not found: {name}")]
    NotFound { name: String },

    /// Malformed operator command.
    #[error("usage: {usage}")]
    Usage { usage: String },
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for log lines.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::InvalidConfig { .. } => "invalid_config",
            SupervisorError::SpawnFailed { .. } => "spawn_failed",
            SupervisorError::StartExhausted { .. } => "start_exhausted",
            SupervisorError::StopFailed { .. } => "stop_failed",
            SupervisorError::NotFound { .. } => "not_found",
            SupervisorError::Usage { .. } => "usage_error",
        }
    }

    pub(crate) fn invalid_config(subject: impl Into<String>, message: impl Into<String>) -> Self {
        SupervisorError::InvalidConfig {
            subject: subject.into(),
            message: message.into(),
        }
    }
}
