//! Error taxonomy shared across the ingestion pipeline.

use thiserror::Error;

/// The error kinds enumerated by the ingestion pipeline's design.
///
/// Transient kinds are expected to be absorbed by a retry layer (the
/// fetcher, the upload queue); the rest abort the enclosing shard.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("permanent http error (status {status}): {message}")]
    PermanentHttp { status: u16, message: String },

    #[error("schema validation error: {0}")]
    SchemaValidation(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("upload error: {0}")]
    Upload(String),

    #[error("cursor corruption: {0}")]
    CursorCorruption(String),

    #[error("partition repair error: {0}")]
    PartitionRepair(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Whether this error kind is expected to have already been retried
    /// internally, i.e. surfacing it means the retry budget is exhausted.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IngestError::TransientNetwork(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Shared transient-error classification used by both the fetcher (C6) and
/// the upload queue (C4): network errors and 429/5xx are retried, any other
/// 4xx is terminal. One classifier, one place, so the two retry layers never
/// disagree about what "transient" means.
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Classifies a lower-cased error message produced by an HTTP client
/// (`reqwest`'s `Display` impl) as transient. Connection resets, timeouts,
/// unreachable hosts and socket-hang-ups are retried; anything else is
/// treated as terminal so we never retry forever on a malformed request.
pub fn is_transient_message(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("timed out")
        || m.contains("timeout")
        || m.contains("connection reset")
        || m.contains("connection refused")
        || m.contains("host unreachable")
        || m.contains("socket hang up")
        || m.contains("broken pipe")
        || m.contains("dns error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_429_and_5xx() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_transient_status(status), "status {status}");
        }
    }

    #[test]
    fn does_not_retry_other_4xx() {
        for status in [400, 401, 403, 404] {
            assert!(!is_transient_status(status), "status {status}");
        }
    }

    #[test]
    fn classifies_network_messages() {
        assert!(is_transient_message("Connection reset by peer"));
        assert!(is_transient_message("operation timed out"));
        assert!(!is_transient_message("invalid header value"));
    }
}
