//! # Sync Error Types
//!
//! Error types for the event channel, on both the hub and terminal side.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  MissingTermId  │  │  Disconnected   │  │  UnsupportedVersion     │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  UnexpectedMessageType  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │      Hub        │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  Rejected       │  │  ChannelError   │                              │
//! │  │  Lagged         │  │  ShuttingDown   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Terminals see every transport-level failure as
//! `CoreError::NetworkFailure`; see the `From<SyncError>` impl below.

use cue_core::CoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all event channel failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing terminal ID (required for the hello handshake).
    #[error("Terminal ID not configured. Run initial setup first.")]
    MissingTerminalId,

    /// Invalid hub URL.
    #[error("Invalid hub URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket disconnected unexpectedly.
    #[error("Disconnected from hall server")]
    Disconnected,

    /// Connection or request timeout.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Unsupported protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Failed to serialize or deserialize a frame.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Unexpected message type.
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    // =========================================================================
    // Hub Errors
    // =========================================================================
    /// The hub refused the request (bad token, unknown room, ...).
    #[error("Rejected by hub ({code}): {message}")]
    Rejected { code: String, message: String },

    /// A subscriber fell behind the broadcast channel and lost events.
    #[error("Subscriber lagged, {0} events dropped")]
    Lagged(u64),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The component is shutting down.
    #[error("Sync component is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

/// Terminals surface channel trouble through the shared taxonomy.
impl From<SyncError> for CoreError {
    fn from(err: SyncError) -> Self {
        CoreError::NetworkFailure(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the connection may be re-established and the read
    /// retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - Temporary disconnections
    /// - Lag (recovered by a fresh snapshot)
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Protocol/version mismatches
    /// - Hub rejections
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::Lagged(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingTerminalId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::UnsupportedVersion(_)
                | SyncError::SerializationFailed(_)
                | SyncError::UnexpectedMessageType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cue_core::RejectReason;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());
        assert!(SyncError::Lagged(12).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::MissingTerminalId.is_retryable());
        assert!(!SyncError::UnsupportedVersion(99).is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::InvalidUrl("x".into()).is_config_error());
        assert!(SyncError::InvalidMessage("x".into()).is_protocol_error());
        assert!(!SyncError::Disconnected.is_protocol_error());
    }

    #[test]
    fn test_converts_to_network_failure() {
        let core: CoreError = SyncError::Timeout(5).into();
        assert_eq!(core.reason(), RejectReason::NetworkFailure);
        assert!(core.is_retryable());
    }
}
