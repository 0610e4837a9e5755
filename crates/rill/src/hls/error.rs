use reqwest::StatusCode;
use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum HlsDownloaderError {
    #[error("Playlist error: {0}")]
    PlaylistError(String),
    #[error("No key resolver accepted the stream: {0}")]
    UnsupportedSource(String),
    #[error("Segment fetch error: {0}")]
    SegmentFetchError(String),
    #[error("Server returned HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },
    #[error("Decryption error: {0}")]
    DecryptionError(String),
    #[error("Merge error: {0}")]
    MergeError(String),
    #[error("Network error: {source}")]
    NetworkError {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Operation timed out: {0}")]
    TimeoutError(String),
    #[error("Operation cancelled")]
    Cancelled,
}

// Manual From impls because of the Arc wrapping.
impl From<reqwest::Error> for HlsDownloaderError {
    fn from(err: reqwest::Error) -> Self {
        HlsDownloaderError::NetworkError {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for HlsDownloaderError {
    fn from(err: std::io::Error) -> Self {
        HlsDownloaderError::IoError {
            source: Arc::new(err),
        }
    }
}

impl HlsDownloaderError {
    /// Whether a failed segment fetch may be retried.
    ///
    /// Transport errors, server errors (5xx) and local I/O failures are
    /// transient. Client errors (4xx), decryption failures and an
    /// unsupported source are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            HlsDownloaderError::NetworkError { .. } | HlsDownloaderError::IoError { .. } => true,
            HlsDownloaderError::HttpStatus { status, .. } => status.is_server_error(),
            HlsDownloaderError::TimeoutError(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let e = HlsDownloaderError::HttpStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: "http://example.com/seg1.ts".into(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let e = HlsDownloaderError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            url: "http://example.com/seg1.ts".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!HlsDownloaderError::UnsupportedSource("sample-aes".into()).is_retryable());
        assert!(!HlsDownloaderError::DecryptionError("bad padding".into()).is_retryable());
    }
}
