//! Error taxonomy for the ingestion pipeline.
//!
//! Only transport failures ever reach a caller. Decode and parse failures are
//! rendered into the session log and the batch is dropped; a fetch deadline is
//! reported as `FetchOutcome::Timeout`, not as an error.

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Connect, subscribe or disconnect failed at the transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload bytes were not valid UTF-8.
    #[error("decode error: payload is not valid UTF-8 (preview: {preview})")]
    Decode { preview: String },

    /// Payload text was not JSON, or not shaped like a detection batch.
    #[error("malformed payload: {reason}; raw: {raw}")]
    MalformedPayload { reason: String, raw: String },
}

impl IngestError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
