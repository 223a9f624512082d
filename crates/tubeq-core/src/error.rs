//! Error types for tubeq core

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in tubeq core
#[derive(Debug, Error)]
pub enum TubeqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to start download tool '{tool}': {source}")]
    ToolInvocation {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Download tool exited with code {}{}", .code, format_detail(.message))]
    ToolFailed { code: i32, message: Option<String> },

    #[error("All {total} playlist items failed; last error: {last}")]
    ItemsFailed { total: usize, last: String },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("A queue run is already active (pid {0})")]
    RunActive(u32),
}

fn format_detail(message: &Option<String>) -> String {
    match message {
        Some(message) => format!(": {}", message),
        None => String::new(),
    }
}

impl TubeqError {
    /// Cancellation is a normal outcome, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TubeqError::Cancelled)
    }
}

// Allow converting to String for transport layers
impl From<TubeqError> for String {
    fn from(error: TubeqError) -> Self {
        error.to_string()
    }
}
