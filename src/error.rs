//! Error taxonomy for the streaming core.
//!
//! Only `SourceUnavailable` is surfaced to callers of the source lifecycle
//! operations. The other variants are raised per frame and absorbed by the
//! pipeline or the publisher, which log them and keep (or end) the stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// File missing, or the camera could not be opened/probed on any backend.
    #[error("source unavailable: {what}: {cause}")]
    SourceUnavailable { what: String, cause: String },

    /// Zero-dimension or malformed frame.
    #[error("invalid frame {width}x{height}: {reason}")]
    InvalidFrame {
        width: u32,
        height: u32,
        reason: String,
    },

    /// The detection oracle failed for one frame.
    #[error("model inference failed: {0}")]
    ModelInference(String),

    /// The annotated frame could not be encoded to a payload.
    #[error("frame encoding failed: {0}")]
    Encoding(String),
}

impl StreamError {
    pub(crate) fn unavailable(what: impl Into<String>, cause: &anyhow::Error) -> Self {
        StreamError::SourceUnavailable {
            what: what.into(),
            cause: format!("{cause:#}"),
        }
    }

    pub fn is_invalid_frame(&self) -> bool {
        matches!(self, StreamError::InvalidFrame { .. })
    }
}

/// True when an `anyhow` error wraps `StreamError::InvalidFrame`.
pub(crate) fn is_invalid_frame(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StreamError>()
        .is_some_and(StreamError::is_invalid_frame)
}
