// Decryption key resolution.
//
// A session resolves its key material exactly once, before the first
// segment fetch. Resolvers are registered in priority order and the first
// one whose `matches` accepts the stream wins. An encrypted stream that no
// resolver accepts is an unsupported source and terminates the session.

use crate::hls::HlsDownloaderError;
use crate::hls::config::HlsConfig;
use crate::hls::decryption::{DecryptionContext, parse_iv_hex, parse_key_hex};
use crate::hls::fetcher::MediaFetcher;
use async_trait::async_trait;
use m3u8_rs::KeyMethod;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// What a session knows about its stream before key resolution.
#[derive(Debug, Clone)]
pub struct KeySource {
    /// URL of the media playlist being consumed
    pub manifest_url: Url,
    /// Base URL for resolving relative URIs
    pub base_url: Url,
    /// Encryption descriptor from the playlist, if any
    pub key: Option<m3u8_rs::Key>,
}

/// Product of key resolution, read-only for the rest of the session.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub decryption: Option<DecryptionContext>,
    /// Prefix segment URIs are joined against
    pub url_prefix: Url,
}

impl ResolvedSource {
    pub fn is_encrypted(&self) -> bool {
        self.decryption.is_some()
    }
}

#[async_trait]
pub trait KeyResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this resolver can handle the stream. Must be cheap and
    /// side-effect free.
    fn matches(&self, source: &KeySource) -> bool;

    async fn resolve(&self, source: &KeySource) -> Result<ResolvedSource, HlsDownloaderError>;
}

/// Priority-ordered resolver registry. Registration order is priority
/// order; the first matching resolver is asked to resolve and its result
/// (success or failure) is final.
#[derive(Default)]
pub struct KeyResolverRegistry {
    resolvers: Vec<Box<dyn KeyResolver>>,
}

impl KeyResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resolver: Box<dyn KeyResolver>) {
        self.resolvers.push(resolver);
    }

    pub async fn resolve(&self, source: &KeySource) -> Result<ResolvedSource, HlsDownloaderError> {
        for resolver in &self.resolvers {
            if resolver.matches(source) {
                debug!(resolver = resolver.name(), "Key resolver matched stream");
                return resolver.resolve(source).await;
            }
        }
        Err(HlsDownloaderError::UnsupportedSource(describe(source)))
    }
}

fn describe(source: &KeySource) -> String {
    match &source.key {
        Some(key) => format!(
            "method {:?}, key URI {:?} ({})",
            key.method, key.uri, source.manifest_url
        ),
        None => format!("unencrypted stream {}", source.manifest_url),
    }
}

/// Resolver backed by a caller-supplied key, taking precedence over
/// anything the playlist declares.
pub struct OverrideKeyResolver {
    key: [u8; 16],
    iv: Option<[u8; 16]>,
}

impl OverrideKeyResolver {
    pub fn new(key_hex: &str, iv_hex: Option<&str>) -> Result<Self, HlsDownloaderError> {
        let key = parse_key_hex(key_hex)?;
        let iv = iv_hex.map(parse_iv_hex).transpose()?;
        Ok(Self { key, iv })
    }
}

#[async_trait]
impl KeyResolver for OverrideKeyResolver {
    fn name(&self) -> &'static str {
        "override"
    }

    fn matches(&self, _source: &KeySource) -> bool {
        true
    }

    async fn resolve(&self, source: &KeySource) -> Result<ResolvedSource, HlsDownloaderError> {
        // Fall back to the manifest IV when the caller gave only a key.
        let manifest_iv = source
            .key
            .as_ref()
            .and_then(|k| k.iv.as_deref())
            .map(parse_iv_hex)
            .transpose()?;

        Ok(ResolvedSource {
            decryption: Some(DecryptionContext {
                key: self.key,
                iv: self.iv.or(manifest_iv),
            }),
            url_prefix: source.base_url.clone(),
        })
    }
}

/// Resolver that fetches an AES-128 key from the URI the playlist points at.
pub struct RemoteKeyResolver {
    fetcher: Arc<dyn MediaFetcher>,
    config: Arc<HlsConfig>,
}

impl RemoteKeyResolver {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, config: Arc<HlsConfig>) -> Self {
        Self { fetcher, config }
    }

    fn key_url(&self, source: &KeySource, uri: &str) -> Result<Url, HlsDownloaderError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            Url::parse(uri).map_err(|e| {
                HlsDownloaderError::DecryptionError(format!("Invalid key URI {uri}: {e}"))
            })
        } else {
            source.base_url.join(uri).map_err(|e| {
                HlsDownloaderError::DecryptionError(format!(
                    "Could not join base URL with key URI {uri}: {e}"
                ))
            })
        }
    }

    async fn fetch_key(&self, key_url: &Url) -> Result<bytes::Bytes, HlsDownloaderError> {
        let max_retries = self.config.fetcher_config.max_key_retries;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.fetcher.fetch_bytes(key_url, None).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempts < max_retries => {
                    debug!(url = %key_url, attempt = attempts, error = %e, "Key fetch failed, retrying");
                }
                Err(e) => return Err(e),
            }
            let delay = self.config.fetcher_config.key_retry_delay_base
                * 2_u32.pow(attempts.saturating_sub(1));
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl KeyResolver for RemoteKeyResolver {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn matches(&self, source: &KeySource) -> bool {
        source
            .key
            .as_ref()
            .is_some_and(|k| k.method == KeyMethod::AES128 && k.uri.is_some())
    }

    async fn resolve(&self, source: &KeySource) -> Result<ResolvedSource, HlsDownloaderError> {
        let key_info = source.key.as_ref().ok_or_else(|| {
            HlsDownloaderError::InternalError("remote resolver invoked without a key".to_string())
        })?;
        let uri = key_info.uri.as_deref().ok_or_else(|| {
            HlsDownloaderError::DecryptionError("Key URI is missing".to_string())
        })?;

        let key_url = self.key_url(source, uri)?;
        let key_bytes = self.fetch_key(&key_url).await?;
        if key_bytes.len() != 16 {
            return Err(HlsDownloaderError::DecryptionError(format!(
                "Key from {key_url} has length {} (expected 16)",
                key_bytes.len()
            )));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&key_bytes);

        let iv = key_info.iv.as_deref().map(parse_iv_hex).transpose()?;

        info!(url = %key_url, "Resolved AES-128 key");
        Ok(ResolvedSource {
            decryption: Some(DecryptionContext { key, iv }),
            url_prefix: source.base_url.clone(),
        })
    }
}

/// Resolver for streams that declare no encryption.
pub struct ClearStreamResolver;

#[async_trait]
impl KeyResolver for ClearStreamResolver {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn matches(&self, source: &KeySource) -> bool {
        source.key.is_none()
    }

    async fn resolve(&self, source: &KeySource) -> Result<ResolvedSource, HlsDownloaderError> {
        Ok(ResolvedSource {
            decryption: None,
            url_prefix: source.base_url.clone(),
        })
    }
}

/// Default registry: caller override first, then remote key fetch, then
/// unencrypted passthrough.
pub fn default_registry(
    fetcher: Arc<dyn MediaFetcher>,
    config: Arc<HlsConfig>,
    key_override: Option<&str>,
    iv_override: Option<&str>,
) -> Result<KeyResolverRegistry, HlsDownloaderError> {
    let mut registry = KeyResolverRegistry::new();
    if let Some(key_hex) = key_override {
        registry.register(Box::new(OverrideKeyResolver::new(key_hex, iv_override)?));
    }
    registry.register(Box::new(RemoteKeyResolver::new(fetcher, config)));
    registry.register(Box::new(ClearStreamResolver));
    Ok(registry)
}
