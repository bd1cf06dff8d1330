use std::time::Duration;

use bytes::Bytes;
use reqwest::{header::HeaderMap, StatusCode};

/// Boxed error used for failures coming from outside the crate.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An attempt did not complete before its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection reset, refused or broken while talking to the peer.
    #[error("connectivity error: {0}")]
    Connectivity(#[source] BoxError),
    /// Any other failure reported by `reqwest`.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// Retry budget consumed; `source` is the last concrete failure.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of times the operation was invoked.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        source: Box<Error>,
    },
    /// An attempt failed after its read-once stream body was handed to the
    /// transport, so it cannot be replayed.
    #[error("stream body cannot be resent on retry: {source}")]
    NonRetryableStreamBody {
        /// Failure of the attempt that consumed the body.
        #[source]
        source: Box<Error>,
    },
    /// A single-consumption body was read twice.
    #[error("body content was already consumed")]
    BodyAlreadyConsumed,
    /// Materializing a body went past the configured cap.
    #[error("body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
    /// Response status outside the accepted set for the request.
    #[error("unexpected http status {status}")]
    UnexpectedStatus {
        status: StatusCode,
        headers: HeaderMap,
        /// Response body, materialized up to the client size cap.
        body: Bytes,
    },
    /// The transfer was cancelled by the other side of a stream bridge.
    #[error("transfer cancelled")]
    Cancelled,
    /// Body content could not be decoded as UTF-8 or JSON.
    #[error("decode error: {0}")]
    Decode(String),
    /// Request could not be built from the given parts.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Returns the innermost failure, unwrapping nested retry layers.
    pub fn last_cause(&self) -> &Error {
        let mut current = self;
        while let Error::RetriesExhausted { source, .. } = current {
            current = source;
        }
        current
    }

    /// Failures that no retry policy may repeat.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::NonRetryableStreamBody { .. }
                | Error::BodyAlreadyConsumed
                | Error::BodyTooLarge { .. }
                | Error::InvalidRequest(_)
                | Error::Cancelled
        )
    }

    /// Maps a `reqwest` failure onto the crate taxonomy.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Error::Timeout(timeout)
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Error::Connectivity(Box::new(err))
        } else {
            Error::Transport(err)
        }
    }
}
