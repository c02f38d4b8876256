//! Upload error types.

use tabletop_common::http::HttpError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Application server or storage endpoint rejected the request.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// `upload_chunk`/`finalize` called without a successful `initialize`.
    #[error("No active upload session")]
    NoActiveSession,

    /// `initialize` called while a segment is still in flight.
    #[error("An upload session is already active")]
    SessionActive,

    #[error("Upload session already finalized")]
    AlreadyFinalized,

    #[error("Upload session was aborted")]
    Aborted,

    /// The storage endpoint answered with something we can't use.
    #[error("Unexpected upload response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        UploadError::Http(HttpError::Http(e))
    }
}

impl UploadError {
    /// Whether retrying the same call can succeed.
    ///
    /// Network failures, 5xx, 408 and 429 are transient; session-state errors and
    /// other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(HttpError::Http(e)) => match e.status() {
                Some(status) => status.is_server_error(),
                None => true,
            },
            Self::Http(HttpError::Api { status, .. }) => {
                *status >= 500 || *status == 408 || *status == 429
            }
            Self::Http(_) => false,
            Self::Protocol(_)
            | Self::NoActiveSession | Self::SessionActive | Self::AlreadyFinalized | Self::Aborted => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let api = |status| UploadError::Http(HttpError::Api { status, message: String::new() });
        assert!(api(503).is_retryable());
        assert!(api(429).is_retryable());
        assert!(!api(403).is_retryable());
        assert!(!UploadError::AlreadyFinalized.is_retryable());
        assert!(!UploadError::NoActiveSession.is_retryable());
    }
}
