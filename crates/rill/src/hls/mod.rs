// HLS downloader implementation

pub mod archive;
pub mod config;
pub mod decryption;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod hls_downloader;
pub mod keys;
pub mod live;
pub mod merge;
pub mod playlist;
pub mod scheduler;
pub mod session;

// Re-exports for easier access
pub use config::{HlsConfig, MergeStrategy, VariantSelectionPolicy};
pub use error::HlsDownloaderError;
pub use events::DownloadEvent;
pub use hls_downloader::HlsDownloader;
pub use session::{SessionPhase, SessionSummary};
