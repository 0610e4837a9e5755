// HLS Media Fetcher: single-attempt HTTP transfers for segments and keys.
// Retry policy lives in the scheduler, which owns the attempt counter.

use crate::hls::HlsDownloaderError;
use crate::hls::config::HlsConfig;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::sync::Arc;
use tracing::debug;
use url::Url;

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetch a segment (or key) body. One attempt, no retries.
    async fn fetch_bytes(
        &self,
        url: &Url,
        byte_range: Option<&m3u8_rs::ByteRange>,
    ) -> Result<Bytes, HlsDownloaderError>;
}

pub struct HttpFetcher {
    http_client: Client,
    config: Arc<HlsConfig>,
}

impl HttpFetcher {
    pub fn new(http_client: Client, config: Arc<HlsConfig>) -> Self {
        Self {
            http_client,
            config,
        }
    }
}

/// `Range` header value for an `EXT-X-BYTERANGE` entry. The end is
/// inclusive; a zero-length range is clamped instead of underflowing.
fn range_header(range: &m3u8_rs::ByteRange) -> String {
    let offset = range.offset.unwrap_or(0);
    format!("bytes={}-{}", offset, offset + range.length.saturating_sub(1))
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch_bytes(
        &self,
        url: &Url,
        byte_range: Option<&m3u8_rs::ByteRange>,
    ) -> Result<Bytes, HlsDownloaderError> {
        let mut request_builder = self.http_client.get(url.clone());
        if let Some(range) = byte_range {
            request_builder = request_builder.header(reqwest::header::RANGE, range_header(range));
        }

        let response = request_builder
            .timeout(self.config.fetcher_config.segment_download_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HlsDownloaderError::HttpStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        debug!(url = %url, bytes = body.len(), "Fetched segment body");
        Ok(body)
    }
}
