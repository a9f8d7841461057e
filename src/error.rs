//! Error handling for the install pipeline
//!
//! Every worker failure ends up as an `InstallError` so the event stream can
//! surface a single readable message. Library code returns these typed errors;
//! the binary and the config loader wrap them in `anyhow` at the edges.

use crate::planner::PlanRejection;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for disk preparation and installation
#[derive(Error, Debug)]
pub enum InstallError {
    /// An external program exited unsuccessfully. `stderr` is kept verbatim.
    #[error("`{command}` failed ({}): {}", describe_exit(.exit_code), .stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A partition device node never appeared after a table change
    #[error("device {} did not appear within {timeout_secs}s", .path.display())]
    DeviceNotReady { path: PathBuf, timeout_secs: u64 },

    /// The planner refused the requested layout
    #[error("plan rejected: {0}")]
    PlanRejected(#[from] PlanRejection),

    /// A required binary, image or partition could not be found
    #[error("{0} not found")]
    ResourceNotFound(String),

    /// The program could not be started at all
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO errors (file operations, pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (user input, config values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Pipeline stage machine transition errors
    #[error("Stage transition error: {0}")]
    StageTransition(String),

    /// A worker thread panicked or could not be started
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, InstallError>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl InstallError {
    /// Create a command failure
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Create a missing-resource error
    pub fn resource_not_found(what: impl Into<String>) -> Self {
        Self::ResourceNotFound(what.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a worker error
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }
}
