// src/error.rs
//
// Error taxonomy for the upload engine. Variants are split along the
// retryability boundary: transient transport trouble is retried by the
// worker pool, everything else surfaces to the caller.

use thiserror::Error;

/// Result type alias for chunklift operations
pub type Result<T> = std::result::Result<T, UploadError>;

#[derive(Error, Debug)]
pub enum UploadError {
    /// Bad job inputs (chunk size, worker count, zero-length file).
    /// Surfaced before any network activity.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Local file system failure
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Network-level failure, HTTP 5xx, per-call timeout, or a
    /// length mismatch in the service acknowledgment. Retried.
    #[error("transient transport error: {message}")]
    TransientTransport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The upload slot for a chunk attempt has expired. A fresh slot is
    /// requested; this does not count against the chunk's attempt budget
    /// beyond the refresh cap.
    #[error("upload slot expired for chunk {index}")]
    SlotExpired { index: u32 },

    /// The service reported the chunk identity as invalid (e.g. the
    /// remote object is already closed). Fatal for the chunk and the job.
    #[error("remote rejected chunk {index}: {message}")]
    RemoteRejectedChunk { index: u32, message: String },

    /// The service refused the close call (e.g. the object is already
    /// closed by another writer). Fatal.
    #[error("remote rejected close: {message}")]
    CloseRejected { message: String },

    /// Close was requested while chunks were still outstanding. This is
    /// an ordering bug in the caller, not a race to resolve internally.
    #[error("close requested with {outstanding} chunks not yet acknowledged")]
    IncompleteUpload { outstanding: usize },

    /// Every attempt for a chunk returned a retryable error and the
    /// attempt cap was reached.
    #[error("chunk {index} failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        index: u32,
        attempts: u32,
        last_error: String,
    },

    /// The job-level cancellation signal fired
    #[error("upload cancelled")]
    Cancelled,

    /// The job-level deadline elapsed
    #[error("upload deadline exceeded")]
    DeadlineExceeded,

    /// Persisted resume state could not be read or written
    #[error("resume state error: {message}")]
    Resume { message: String },
}

impl UploadError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransientTransport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_from(message: impl Into<String>, source: reqwest::Error) -> Self {
        Self::TransientTransport {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn resume(message: impl Into<String>) -> Self {
        Self::Resume {
            message: message.into(),
        }
    }

    /// Whether the worker pool may retry the failed attempt.
    ///
    /// Slot expiry is handled separately (fresh slot, not a fresh attempt)
    /// and therefore reports as retryable here.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::TransientTransport { .. } | UploadError::SlotExpired { .. } => true,
            UploadError::Io { source, .. } => {
                use std::io::ErrorKind;
                matches!(
                    source.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(UploadError::transport("connection reset").is_retryable());
        assert!(UploadError::SlotExpired { index: 3 }.is_retryable());
    }

    #[test]
    fn config_and_rejection_are_fatal() {
        assert!(!UploadError::configuration("chunk size 0").is_retryable());
        assert!(
            !UploadError::RemoteRejectedChunk {
                index: 0,
                message: "file already closed".into()
            }
            .is_retryable()
        );
        assert!(!UploadError::Cancelled.is_retryable());
    }

    #[test]
    fn io_retryability_follows_kind() {
        let timed_out = UploadError::io(
            "read",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        );
        assert!(timed_out.is_retryable());

        let not_found = UploadError::io(
            "open",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(!not_found.is_retryable());
    }
}
