// Entry point tying the pieces together: HTTP client, playlist engine,
// key resolver registry and the session drivers.

use crate::hls::HlsDownloaderError;
use crate::hls::archive::ArchiveSession;
use crate::hls::config::HlsConfig;
use crate::hls::events::DownloadEvent;
use crate::hls::fetcher::HttpFetcher;
use crate::hls::keys::default_registry;
use crate::hls::live::LiveSession;
use crate::hls::playlist::PlaylistEngine;
use crate::hls::session::{SessionPaths, SessionProgress, SessionSummary};
use crate::shutdown::StopController;
use crate::{DownloadError, create_client};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Configured HLS downloader. One instance can drive multiple sessions;
/// each session gets its own state.
pub struct HlsDownloader {
    config: Arc<HlsConfig>,
    client: reqwest::Client,
    stop: StopController,
    progress_tx: Option<mpsc::UnboundedSender<DownloadEvent>>,
    key_override: Option<String>,
    iv_override: Option<String>,
}

impl HlsDownloader {
    pub fn new(config: HlsConfig) -> Result<Self, DownloadError> {
        let client = create_client(&config.base)?;
        Ok(Self {
            config: Arc::new(config),
            client,
            stop: StopController::new(),
            progress_tx: None,
            key_override: None,
            iv_override: None,
        })
    }

    /// Share a stop controller with the caller (e.g. a signal handler).
    pub fn with_stop_controller(mut self, stop: StopController) -> Self {
        self.stop = stop;
        self
    }

    /// Receive progress events on the given channel.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<DownloadEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Use an explicit AES-128 key (hex) instead of fetching one, with an
    /// optional explicit IV (hex).
    pub fn with_key_override(
        mut self,
        key_hex: impl Into<String>,
        iv_hex: Option<String>,
    ) -> Self {
        self.key_override = Some(key_hex.into());
        self.iv_override = iv_hex;
        self
    }

    fn session_parts(
        &self,
        output: &Path,
    ) -> Result<
        (
            PlaylistEngine,
            Arc<HttpFetcher>,
            crate::hls::keys::KeyResolverRegistry,
            SessionPaths,
            SessionProgress,
        ),
        HlsDownloaderError,
    > {
        let playlist = PlaylistEngine::new(self.client.clone(), Arc::clone(&self.config));
        let fetcher = Arc::new(HttpFetcher::new(
            self.client.clone(),
            Arc::clone(&self.config),
        ));
        let registry = default_registry(
            fetcher.clone(),
            Arc::clone(&self.config),
            self.key_override.as_deref(),
            self.iv_override.as_deref(),
        )?;
        let paths = SessionPaths::for_output(output);
        let progress = SessionProgress::new(self.progress_tx.clone());
        Ok((playlist, fetcher, registry, paths, progress))
    }

    /// Download a bounded (VOD) playlist into `output`.
    pub async fn download_archive(
        &self,
        url: &str,
        output: &Path,
    ) -> Result<SessionSummary, DownloadError> {
        let (playlist, fetcher, registry, paths, progress) = self.session_parts(output)?;
        let session = ArchiveSession::new(
            Arc::clone(&self.config),
            playlist,
            fetcher,
            registry,
            paths,
            self.stop.clone(),
            progress,
            url.to_string(),
        );
        Ok(session.run().await?)
    }

    /// Record a live playlist into `output` until it ends or is stopped.
    pub async fn download_live(
        &self,
        url: &str,
        output: &Path,
    ) -> Result<SessionSummary, DownloadError> {
        let (playlist, fetcher, registry, paths, progress) = self.session_parts(output)?;
        let session = LiveSession::new(
            Arc::clone(&self.config),
            playlist,
            fetcher,
            registry,
            paths,
            self.stop.clone(),
            progress,
            url.to_string(),
        );
        Ok(session.run().await?)
    }
}
