use reqwest::StatusCode;

use crate::hls::HlsDownloaderError;

// Custom error type for download operations
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    UrlError(String),

    #[error("Server returned status code {0}")]
    StatusCode(StatusCode),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid proxy configuration: {0}")]
    ProxyError(String),

    #[error("HLS error: {0}")]
    HlsError(#[from] HlsDownloaderError),

    #[error("Generic download error: {0}")]
    Generic(String),
}
