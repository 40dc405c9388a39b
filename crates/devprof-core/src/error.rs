//! Profiler Error Types
//!
//! Every failure in the measurement core is fatal to the enclosing session.
//! Transient readiness-probe failures never reach this type: they are
//! counted by the retrier and swallowed.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for profiler operations
pub type ProfileResult<T> = Result<T, ProfileError>;

/// Errors that can abort a measurement session
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The external process could not be started
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The event stream failed before it ever reported "open"
    #[error("Event stream at {url} failed to open: {message}")]
    StreamConnect { url: String, message: String },

    /// The page request got a response but its body could not be read
    #[error("Page load of {url} failed: {message}")]
    PageLoad { url: String, message: String },

    /// The external process exited while the session still depended on it
    #[error("'{command}' exited early with code {code:?}")]
    ProcessExited { command: String, code: Option<i32> },

    /// A payload starting with `{` was not valid JSON
    #[error("Malformed event payload: {reason} (payload: {payload})")]
    MalformedEventPayload { payload: String, reason: String },

    /// The event stream closed while a consumer was still waiting
    #[error("Event stream closed")]
    StreamClosed,

    /// A caller-imposed deadline elapsed
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The change collaborator failed to prepare or apply a mutation
    #[error("Failed to mutate {target}: {source}")]
    Mutation {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The trace collector failed to bind or shut down
    #[error("Trace collector error: {message}")]
    Collector { message: String },

    /// Signal delivery to the external process failed
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Invalid session configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfileError {
    /// Create a spawn failure error
    pub fn spawn_failure(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailure {
            command: command.into(),
            source,
        }
    }

    /// Create a stream connect error
    pub fn stream_connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StreamConnect {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a page load error
    pub fn page_load(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PageLoad {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a malformed payload error
    pub fn malformed_payload(payload: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEventPayload {
            payload: payload.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a mutation error
    pub fn mutation(target: impl Into<String>, source: std::io::Error) -> Self {
        Self::Mutation {
            target: target.into(),
            source,
        }
    }

    /// Create a collector error
    pub fn collector(message: impl Into<String>) -> Self {
        Self::Collector {
            message: message.into(),
        }
    }
}
