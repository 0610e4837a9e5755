// HLS Playlist Engine: fetching, parsing and refreshing media playlists.

use crate::hls::HlsDownloaderError;
use crate::hls::config::{HlsConfig, VariantSelectionPolicy};
use bytes::Bytes;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, VariantStream, parse_playlist_res};
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// One segment entry of a parsed snapshot, URI as written in the manifest.
#[derive(Debug, Clone)]
pub struct SnapshotSegment {
    pub uri: String,
    pub duration: f32,
    pub byte_range: Option<m3u8_rs::ByteRange>,
}

/// Immutable product of parsing one media playlist body.
///
/// A snapshot never changes after construction; the live loop replaces the
/// whole value on every refresh.
#[derive(Debug, Clone)]
pub struct MediaSnapshot {
    pub segments: Vec<SnapshotSegment>,
    pub target_duration: u64,
    pub media_sequence: u64,
    /// Encryption descriptor of the stream, taken from the first segment
    /// that declares one.
    pub key: Option<m3u8_rs::Key>,
    pub end_list: bool,
}

impl MediaSnapshot {
    fn from_media_playlist(pl: MediaPlaylist) -> Result<Self, HlsDownloaderError> {
        let key = pl
            .segments
            .iter()
            .find_map(|s| s.key.clone())
            .filter(|k| k.method != KeyMethod::None);

        if let Some(key) = &key {
            if key.method == KeyMethod::AES128 && key.uri.is_none() {
                return Err(HlsDownloaderError::PlaylistError(
                    "AES-128 key declared without a key URI".to_string(),
                ));
            }
        }

        let segments = pl
            .segments
            .iter()
            .map(|s| SnapshotSegment {
                uri: s.uri.clone(),
                duration: s.duration,
                byte_range: s.byte_range.clone(),
            })
            .collect();

        Ok(Self {
            segments,
            target_duration: pl.target_duration,
            media_sequence: pl.media_sequence,
            key,
            end_list: pl.end_list,
        })
    }
}

/// Parse a media playlist body into an immutable snapshot.
///
/// Pure and side-effect free. Fails on unparsable text and on a master
/// playlist, which has no segments to snapshot.
pub fn parse_media_snapshot(bytes: &[u8]) -> Result<MediaSnapshot, HlsDownloaderError> {
    match parse_playlist_res(bytes) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => MediaSnapshot::from_media_playlist(pl),
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(HlsDownloaderError::PlaylistError(
            "Expected a media playlist, got a master playlist".to_string(),
        )),
        Err(e) => Err(HlsDownloaderError::PlaylistError(format!(
            "Failed to parse playlist: {e}"
        ))),
    }
}

/// Pick a variant out of a master playlist according to the policy.
pub fn select_variant<'a>(
    master: &'a MasterPlaylist,
    policy: &VariantSelectionPolicy,
) -> Result<&'a VariantStream, HlsDownloaderError> {
    if master.variants.is_empty() {
        return Err(HlsDownloaderError::PlaylistError(
            "Master playlist has no variants".to_string(),
        ));
    }
    let selected = match policy {
        VariantSelectionPolicy::HighestBitrate => {
            master.variants.iter().max_by_key(|v| v.bandwidth)
        }
        VariantSelectionPolicy::LowestBitrate => master.variants.iter().min_by_key(|v| v.bandwidth),
        VariantSelectionPolicy::ClosestToBitrate(target_bw) => master
            .variants
            .iter()
            .min_by_key(|v| (*target_bw as i64 - v.bandwidth as i64).abs()),
    };
    selected.ok_or_else(|| {
        HlsDownloaderError::PlaylistError("No variant matched the selection policy".to_string())
    })
}

/// Details of the media playlist a session ends up consuming.
#[derive(Debug, Clone)]
pub struct MediaPlaylistHandle {
    pub snapshot: MediaSnapshot,
    /// URL the media playlist is (re-)fetched from
    pub url: Url,
    /// Base URL for resolving relative segment and key URIs
    pub base_url: Url,
}

pub struct PlaylistEngine {
    http_client: Client,
    config: Arc<HlsConfig>,
}

impl PlaylistEngine {
    pub fn new(http_client: Client, config: Arc<HlsConfig>) -> Self {
        Self {
            http_client,
            config,
        }
    }

    async fn fetch_playlist_bytes(&self, url: &Url) -> Result<Bytes, HlsDownloaderError> {
        let response = self
            .http_client
            .get(url.clone())
            .timeout(self.config.playlist_config.playlist_fetch_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HlsDownloaderError::PlaylistError(format!(
                "Failed to fetch playlist {url}: HTTP {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?)
    }

    /// Load the media playlist behind `url_str`, following one level of
    /// master playlist indirection with the configured variant policy.
    pub async fn load(&self, url_str: &str) -> Result<MediaPlaylistHandle, HlsDownloaderError> {
        let playlist_url = Url::parse(url_str).map_err(|e| {
            HlsDownloaderError::PlaylistError(format!("Invalid playlist URL {url_str}: {e}"))
        })?;
        let body = self.fetch_playlist_bytes(&playlist_url).await?;

        let media_url = match parse_playlist_res(&body) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(pl)) => {
                let base_url = derive_base_url(&playlist_url)?;
                return Ok(MediaPlaylistHandle {
                    snapshot: MediaSnapshot::from_media_playlist(pl)?,
                    url: playlist_url,
                    base_url,
                });
            }
            Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
                let variant =
                    select_variant(&master, &self.config.playlist_config.variant_selection_policy)?;
                info!(
                    bandwidth = variant.bandwidth,
                    uri = %variant.uri,
                    "Selected variant from master playlist"
                );
                playlist_url.join(&variant.uri).map_err(|e| {
                    HlsDownloaderError::PlaylistError(format!(
                        "Could not join master URL with variant URI {}: {e}",
                        variant.uri
                    ))
                })?
            }
            Err(e) => {
                return Err(HlsDownloaderError::PlaylistError(format!(
                    "Failed to parse playlist {playlist_url}: {e}"
                )));
            }
        };

        let body = self.fetch_playlist_bytes(&media_url).await?;
        let snapshot = parse_media_snapshot(&body)?;
        let base_url = derive_base_url(&media_url)?;
        Ok(MediaPlaylistHandle {
            snapshot,
            url: media_url,
            base_url,
        })
    }

    /// Re-fetch a media playlist for a live session.
    ///
    /// Returns `Ok(None)` when the body is byte-identical to the previous
    /// fetch; parsing is skipped in that case. `last_body` is updated on
    /// every changed fetch that parses.
    pub async fn refresh(
        &self,
        media_url: &Url,
        last_body: &mut Option<Bytes>,
    ) -> Result<Option<MediaSnapshot>, HlsDownloaderError> {
        let body = self.fetch_playlist_bytes(media_url).await?;

        if let Some(last) = last_body.as_ref() {
            if last == &body {
                debug!(url = %media_url, "Playlist unchanged, skipping parse");
                return Ok(None);
            }
        }

        let snapshot = parse_media_snapshot(&body)?;
        *last_body = Some(body);
        Ok(Some(snapshot))
    }
}

/// Base URL for resolving relative URIs in a playlist.
pub fn derive_base_url(playlist_url: &Url) -> Result<Url, HlsDownloaderError> {
    playlist_url.join(".").map_err(|e| {
        HlsDownloaderError::PlaylistError(format!(
            "Failed to determine base URL of {playlist_url}: {e}"
        ))
    })
}
