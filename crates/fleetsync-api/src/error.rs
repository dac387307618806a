use thiserror::Error;

/// Top-level error type for the `fleetsync-api` crate.
///
/// Covers every failure mode of the backend and message-source seams.
/// `fleetsync-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Backend ─────────────────────────────────────────────────────
    /// The backend answered but rejected the request.
    #[error("Backend error ({code}): {message}")]
    Backend { code: String, message: String },

    /// The backend does not know the requested device.
    #[error("Device {device_id} is unknown to the backend")]
    UnknownDevice { device_id: String },

    // ── Transport ───────────────────────────────────────────────────
    /// Transport-level failure (connection refused, broker gone, etc.)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation requires a connected message source.
    #[error("Message source is not connected")]
    NotConnected,

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// Local file access failed (snapshot backends).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if the failure is on the wire rather than in the payload,
    /// i.e. the same request might succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotConnected | Self::Timeout { .. })
    }
}
