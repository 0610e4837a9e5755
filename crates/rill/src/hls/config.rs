use std::time::Duration;

use crate::DownloaderConfig;

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    /// Base transport configuration
    pub base: DownloaderConfig,
    pub playlist_config: HlsPlaylistConfig,
    pub scheduler_config: HlsSchedulerConfig,
    pub fetcher_config: HlsFetcherConfig,
    pub merge_config: HlsMergeConfig,
}

// --- Playlist Configuration ---
#[derive(Debug, Clone)]
pub struct HlsPlaylistConfig {
    pub playlist_fetch_timeout: Duration,
    /// Upper bound on the live refresh sleep. The actual sleep is the
    /// minimum of this cap and the playlist target duration.
    pub live_refresh_cap: Duration,
    /// Consecutive refresh failures tolerated before the session errors out.
    pub live_max_refresh_retries: u32,
    pub variant_selection_policy: VariantSelectionPolicy,
}

impl Default for HlsPlaylistConfig {
    fn default() -> Self {
        Self {
            playlist_fetch_timeout: Duration::from_secs(15),
            live_refresh_cap: Duration::from_secs(5),
            live_max_refresh_retries: 5,
            variant_selection_policy: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum VariantSelectionPolicy {
    #[default]
    HighestBitrate,
    LowestBitrate,
    /// Select the variant closest to the given bandwidth (bits/s)
    ClosestToBitrate(u64),
}

// --- Scheduler Configuration ---
#[derive(Debug, Clone)]
pub struct HlsSchedulerConfig {
    /// Max concurrent segment downloads
    pub download_concurrency: usize,
}

impl Default for HlsSchedulerConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 5,
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct HlsFetcherConfig {
    pub segment_download_timeout: Duration,
    /// Total attempts allowed per segment, including the first one.
    pub max_segment_retries: u32,
    /// Base for exponential backoff between attempts
    pub segment_retry_delay_base: Duration,
    pub key_download_timeout: Duration,
    pub max_key_retries: u32,
    pub key_retry_delay_base: Duration,
}

impl Default for HlsFetcherConfig {
    fn default() -> Self {
        Self {
            segment_download_timeout: Duration::from_secs(30),
            max_segment_retries: 3,
            segment_retry_delay_base: Duration::from_millis(500),
            key_download_timeout: Duration::from_secs(5),
            max_key_retries: 3,
            key_retry_delay_base: Duration::from_millis(200),
        }
    }
}

// --- Merge Configuration ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Byte-level concatenation of segments in admission order
    #[default]
    Concat,
    /// Remux through ffmpeg (`-f concat -c copy`)
    Remux,
}

#[derive(Debug, Clone, Default)]
pub struct HlsMergeConfig {
    pub strategy: MergeStrategy,
    /// Keep the per-segment temp files after a successful merge.
    pub keep_segments: bool,
}
