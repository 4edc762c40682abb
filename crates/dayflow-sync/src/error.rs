//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Data                │ │
//! │  │                 │  │  (retryable)    │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidPath            │ │
//! │  │  MissingDeviceId│  │  Disconnected   │  │  MalformedPayload       │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  SerializationFailed    │ │
//! │  │                 │  │  Unavailable    │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Local Store    │  │    Protocol     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  LocalStore     │  │  InvalidMessage │  │  ShuttingDown           │ │
//! │  │  ApplyFailed    │  │  Remote         │  │  ChannelError           │ │
//! │  │                 │  │  WebSocketError │  │  ConsumerFailed         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conflicts are not errors: they resolve to a winner and never surface here.

use thiserror::Error;

use dayflow_core::CoreError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not available. Load device identity first.")]
    MissingDeviceId,

    /// Invalid remote URL.
    #[error("Invalid remote URL: {0}")]
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
    /// Failed to establish a connection to the remote.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Remote disconnected or not yet connected.
    #[error("Disconnected from remote store")]
    Disconnected,

    /// Request timeout.
    #[error("Remote request timed out after {0} seconds")]
    Timeout(u64),

    /// Remote is reachable but refuses service right now.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid frame received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The remote answered a request with an error.
    #[error("Remote rejected request: {0}")]
    Remote(String),

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// A path segment failed validation.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A remote node does not decode as an envelope or domain value.
    #[error("Malformed payload at {path}: {reason}")]
    MalformedPayload { path: String, reason: String },

    /// Failed to serialize a value.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Local Store Errors
    // =========================================================================
    /// Local store operation failed.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// Applying a remote change to the local store failed.
    #[error("Failed to apply {collection}/{key}: {reason}")]
    ApplyFailed {
        collection: String,
        key: String,
        reason: String,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A listener consumer returned an error or panicked.
    #[error("Listener consumer failed: {0}")]
    ConsumerFailed(String),

    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MalformedEnvelope { path, reason } => {
                SyncError::MalformedPayload { path, reason }
            }
            CoreError::Payload(e) => SyncError::SerializationFailed(e.to_string()),
            CoreError::Validation(e) => SyncError::InvalidPath(e.to_string()),
        }
    }
}

impl From<dayflow_db::DbError> for SyncError {
    fn from(err: dayflow_db::DbError) -> Self {
        SyncError::LocalStore(err.to_string())
    }
}

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

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if a failed write should go to the retry queue.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - Temporary disconnections and remote unavailability
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Invalid paths and unserializable values
    /// - Remote rejections (the same request would be rejected again)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::RemoteUnavailable(_)
                | SyncError::WebSocketError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the payload itself is at fault.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidPath(_)
                | SyncError::MalformedPayload { .. }
                | SyncError::SerializationFailed(_)
        )
    }
}
