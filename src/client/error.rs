//! Error types for the upload client.

use crate::codec::CodecError;
use thiserror::Error;

/// Errors that can occur while pushing a file through the chunked pipeline.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network failure (connect, reset, timeout).
    #[error("connection error: {0}")]
    Connection(String),

    /// Non-success response from the server.
    #[error("HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("failed to deserialize response: {0}")]
    Deserialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A chunk could not be delivered within the retry budget.
    #[error("chunk {index} failed after {attempts} attempt(s): {source}")]
    ChunkUploadFailed {
        index: u32,
        attempts: u32,
        #[source]
        source: Box<TransportError>,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("reading file: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Connection errors, 5xx, 408 and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Server { status, .. } => *status >= 500 || matches!(*status, 408 | 429),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Deserialization(err.to_string())
        } else if err.is_builder() {
            Self::Configuration(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}
