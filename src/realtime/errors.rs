//! # Real-Time Errors
//!
//! Error types for the realtime supervisor and its collaborators.
//!
//! None of these escape the supervisor's lifecycle methods. They are logged
//! and folded into the reconnect path, so the hosting application only ever
//! sees stale data, never a crash.

use thiserror::Error;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Real-time errors
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    // ==================
    // Channel Errors
    // ==================
    /// Channel was closed by the server or the client
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Channel reported an error
    #[error("Channel error on {topic}: {message}")]
    ChannelFailed { topic: String, message: String },

    /// Channel did not confirm the subscription in time
    #[error("Channel timed out: {0}")]
    ChannelTimeout(String),

    /// Keepalive probe failed or did not answer
    #[error("Keepalive probe failed: {0}")]
    ProbeFailed(String),

    // ==================
    // Session Errors
    // ==================
    /// Session lookup failed
    #[error("Session check failed: {0}")]
    SessionUnavailable(String),

    /// Session refresh was rejected
    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    // ==================
    // Configuration Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl RealtimeError {
    /// Stable code string, used as the `code` field in log lines
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::ChannelClosed(_) => "RT_CHANNEL_CLOSED",
            RealtimeError::ChannelFailed { .. } => "RT_CHANNEL_ERROR",
            RealtimeError::ChannelTimeout(_) => "RT_CHANNEL_TIMEOUT",
            RealtimeError::ProbeFailed(_) => "RT_PROBE_FAILED",
            RealtimeError::SessionUnavailable(_) => "RT_SESSION_UNAVAILABLE",
            RealtimeError::RefreshFailed(_) => "RT_REFRESH_FAILED",
            RealtimeError::ConfigError(_) => "RT_CONFIG_ERROR",
        }
    }
}
