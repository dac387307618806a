// ── Core error types ──
//
// Domain errors from fleetsync-core. Consumers never see raw backend
// failures: the `From<fleetsync_api::Error>` impl translates them.

use thiserror::Error;

use crate::model::SourceId;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Source not found: {source_id}")]
    SourceNotFound { source_id: SourceId },

    #[error("No {kind} source is available to {operation}")]
    SourceUnavailable { kind: String, operation: String },

    // ── Refresh errors ───────────────────────────────────────────────
    #[error("Refresh of source {source_id} failed: {message}")]
    RefreshFailed { source_id: SourceId, message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation rejected by backend: {message}")]
    Rejected { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// The backend-specific error code, if any.
        code: Option<String>,
    },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Backend timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<fleetsync_api::Error> for CoreError {
    fn from(err: fleetsync_api::Error) -> Self {
        match err {
            fleetsync_api::Error::Backend { code, message } => CoreError::Api {
                message,
                code: Some(code),
            },
            fleetsync_api::Error::UnknownDevice { device_id } => CoreError::DeviceNotFound {
                identifier: device_id,
            },
            fleetsync_api::Error::Transport(reason) => CoreError::ConnectionFailed { reason },
            fleetsync_api::Error::NotConnected => CoreError::ConnectionFailed {
                reason: "message source is not connected".into(),
            },
            fleetsync_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            fleetsync_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            fleetsync_api::Error::Io(e) => CoreError::Internal(format!("IO error: {e}")),
        }
    }
}
