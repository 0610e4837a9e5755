//! # Rill
//!
//! A library for downloading segmented HTTP media streams (HLS/M3U8).
//!
//! ## Features
//!
//! - Bounded-concurrency segment scheduling with retry
//! - Live playlist cycling with session-wide deduplication
//! - One-shot archive (VOD) downloads with resume support
//! - Pluggable decryption key resolution (AES-128)
//! - Completion handoff that merges segments into a single output file

pub mod builder;
pub mod config;
pub mod downloader;
pub mod error;
pub mod hls;
pub mod proxy;
pub mod shutdown;

pub use builder::DownloaderConfigBuilder;
pub use config::DownloaderConfig;
pub use downloader::create_client;
pub use error::DownloadError;
pub use shutdown::StopController;

pub use hls::{HlsConfig, HlsDownloader, HlsDownloaderError};

// Re-export proxy utilities
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
