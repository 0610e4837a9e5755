use reqwest::Proxy;

use crate::DownloadError;

/// Proxy protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
    /// Proxy for all protocols
    All,
}

/// Credentials for proxy authentication
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration applied to the shared HTTP client
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

/// Build a reqwest Proxy object from a proxy configuration
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let invalid = |e: reqwest::Error| DownloadError::ProxyError(format!("{}: {e}", config.url));

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(&config.url).map_err(invalid)?,
        ProxyType::Https => Proxy::https(&config.url).map_err(invalid)?,
        ProxyType::Socks5 => {
            // reqwest requires the scheme to be spelled out for SOCKS proxies
            let url = if config.url.starts_with("socks5://") {
                config.url.clone()
            } else {
                format!("socks5://{}", config.url)
            };
            Proxy::all(&url).map_err(invalid)?
        }
        ProxyType::All => Proxy::all(&config.url).map_err(invalid)?,
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}
