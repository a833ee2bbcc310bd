//! Origin protocol error types
//!
//! Provides structured error types for telescope control operations.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the Origin protocol client and its helpers
#[derive(Debug, Clone, Error)]
pub enum OriginError {
    // ========================================================================
    // Link errors (global: fail every in-flight command, trigger reconnection)
    // ========================================================================
    /// Transport failure or the client is not connected
    #[error("Link error: {0}")]
    Link(String),

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection failed after {attempts} attempts: {last_error}")]
    ReconnectionFailed { attempts: u32, last_error: String },

    // ========================================================================
    // Command errors (local to one command)
    // ========================================================================
    /// No response arrived for a command within its timeout
    #[error("Command {method} (#{correlation_id}) timed out after {timeout:?}")]
    CommandTimeout {
        method: String,
        correlation_id: u64,
        timeout: Duration,
    },

    /// The device answered with a non-zero result code
    #[error("Command {method} rejected with code {code}: {message}")]
    CommandRejected {
        method: String,
        code: i64,
        message: String,
    },

    // ========================================================================
    // Data errors
    // ========================================================================
    /// An envelope or payload did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ========================================================================
    // Image transfer errors
    // ========================================================================
    /// An image could not be retrieved after all retries
    #[error("Download of {path} failed after {attempts} attempt(s): {reason}")]
    Download {
        path: String,
        attempts: u32,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl OriginError {
    /// Shorthand for the error returned when no link is available
    pub fn not_connected() -> Self {
        OriginError::Link("not connected".to_string())
    }

    /// True for errors that mean the connection itself is gone
    pub fn is_link(&self) -> bool {
        matches!(
            self,
            OriginError::Link(_) | OriginError::ReconnectionFailed { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OriginError::CommandTimeout { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, OriginError::CommandRejected { .. })
    }

    /// Check if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OriginError::Link(_) | OriginError::CommandTimeout { .. } | OriginError::Io(_)
        )
    }
}

impl From<serde_json::Error> for OriginError {
    fn from(err: serde_json::Error) -> Self {
        OriginError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OriginError {
    fn from(err: std::io::Error) -> Self {
        OriginError::Io(err.to_string())
    }
}

impl From<OriginError> for String {
    fn from(err: OriginError) -> Self {
        err.to_string()
    }
}

/// Result type for Origin operations
pub type OriginResult<T> = Result<T, OriginError>;
