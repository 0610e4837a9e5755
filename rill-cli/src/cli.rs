use clap::Parser;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::path::PathBuf;
use tracing::warn;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Segmented HLS stream downloader",
    long_about = "Download HLS (M3U8) streams, both finished archives and ongoing\n\
                  live broadcasts. Segments are fetched concurrently, decrypted\n\
                  when the stream uses AES-128, and merged into a single output\n\
                  file when the download completes.\n\
                  \n\
                  Interrupted archive downloads can be resumed by running the\n\
                  same command again: segments already on disk are kept."
)]
pub struct CliArgs {
    /// M3U8 playlist URL to download
    #[arg(required = true, help = "URL of the M3U8 playlist (media or master)")]
    pub url: String,

    /// Record a live stream instead of downloading an archive
    #[arg(
        long,
        help = "Treat the URL as a live playlist and poll it until the stream ends"
    )]
    pub live: bool,

    /// Output file path
    #[arg(
        short,
        long,
        default_value = "./output.ts",
        help = "Path of the merged output file"
    )]
    pub output: PathBuf,

    /// Number of concurrent segment downloads
    #[arg(
        short = 'c',
        long,
        default_value = "5",
        value_parser = clap::value_parser!(u32).range(1..=64),
        help = "Maximum number of concurrent segment downloads (1-64)"
    )]
    pub concurrency: u32,

    /// Attempts allowed per segment
    #[arg(
        long,
        default_value = "3",
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Total attempts allowed per segment, including the first one"
    )]
    pub retries: u32,

    /// Explicit AES-128 decryption key (hex)
    #[arg(
        long,
        help = "Use this AES-128 key (hex) instead of fetching the one the playlist points at"
    )]
    pub key: Option<String>,

    /// Explicit AES-128 IV (hex)
    #[arg(long, help = "Use this IV (hex) instead of the one in the playlist")]
    pub iv: Option<String>,

    /// Concatenate segments instead of remuxing through ffmpeg
    #[arg(
        long,
        help = "Merge by raw byte concatenation instead of invoking ffmpeg"
    )]
    pub nomux: bool,

    /// Keep the per-segment files after a successful merge
    #[arg(long, help = "Do not delete the segment temp directory after merging")]
    pub keep: bool,

    /// Overall timeout in seconds for HTTP requests (0 = unlimited)
    #[arg(
        long,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        long,
        help = "Proxy server URL for downloads (e.g., \"http://proxy.example.com:8080\")"
    )]
    pub proxy: Option<String>,

    /// Proxy type (http, https, socks5, all)
    #[arg(
        long,
        default_value = "http",
        help = "Proxy type (http, https, socks5, all)",
        value_parser = ["http", "https", "socks5", "all"]
    )]
    pub proxy_type: String,

    /// Proxy username
    #[arg(long, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    /// Use system proxy settings for downloads
    #[arg(
        long,
        default_value = "true",
        help = "Use system proxy settings for downloads if no explicit proxy is configured"
    )]
    pub use_system_proxy: bool,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        help = "Disable all proxy settings (including system proxy) for downloads"
    )]
    pub no_proxy: bool,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Show a progress bar
    #[arg(
        short = 'P',
        long = "progress",
        help = "Show a progress bar for the download"
    )]
    pub show_progress: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}

/// Parse "Name: Value" header arguments into a HeaderMap, starting from
/// the engine defaults. Malformed entries are skipped with a warning.
pub fn parse_headers(raw: &[String]) -> HeaderMap {
    let mut headers = rill_engine::DownloaderConfig::get_default_headers();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            warn!(header = %entry, "Ignoring malformed header (expected 'Name: Value')");
            continue;
        };
        match (
            name.trim().parse::<HeaderName>(),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %entry, "Ignoring invalid header"),
        }
    }
    headers
}
