use std::time::Duration;

use clap::Parser;
use rill_engine::hls::{HlsConfig, HlsDownloader, MergeStrategy};
use rill_engine::{DownloaderConfig, ProxyAuth, ProxyConfig, ProxyType, StopController};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod error;
mod progress;

use cli::CliArgs;
use error::AppError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Download failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("rill.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("rill - segmented HLS stream downloader");
    info!(
        url = %args.url,
        live = args.live,
        output = %args.output.display(),
        concurrency = args.concurrency,
        "Starting download"
    );

    // Proxy configuration
    let proxy_config = if args.no_proxy {
        info!("All proxy settings disabled (--no-proxy flag)");
        None
    } else if let Some(proxy_url) = args.proxy.as_ref() {
        let proxy_type = match args.proxy_type.as_str() {
            "http" => ProxyType::Http,
            "https" => ProxyType::Https,
            "socks5" => ProxyType::Socks5,
            "all" => ProxyType::All,
            other => {
                return Err(AppError::InvalidInput(format!(
                    "Invalid proxy type: '{other}'"
                )));
            }
        };

        let auth = if let (Some(username), Some(password)) = (&args.proxy_user, &args.proxy_pass) {
            Some(ProxyAuth {
                username: username.clone(),
                password: password.clone(),
            })
        } else {
            None
        };

        info!(
            proxy_url = %proxy_url,
            proxy_type = ?proxy_type,
            has_auth = auth.is_some(),
            "Using explicit proxy configuration for downloads"
        );

        Some(ProxyConfig {
            url: proxy_url.clone(),
            proxy_type,
            auth,
        })
    } else {
        None
    };

    // Transport configuration
    let base_config = {
        let mut builder = DownloaderConfig::builder()
            .with_timeout(Duration::from_secs(args.timeout))
            .with_connect_timeout(Duration::from_secs(args.connect_timeout))
            .with_headers(cli::parse_headers(&args.headers));

        if let Some(proxy) = proxy_config {
            builder = builder.with_proxy(proxy);
        } else {
            builder = builder.with_system_proxy(args.use_system_proxy && !args.no_proxy);
        }
        builder.build()
    };

    let mut hls_config = HlsConfig {
        base: base_config,
        ..Default::default()
    };
    hls_config.scheduler_config.download_concurrency = args.concurrency as usize;
    hls_config.fetcher_config.max_segment_retries = args.retries;
    hls_config.merge_config.strategy = if args.nomux {
        MergeStrategy::Concat
    } else {
        MergeStrategy::Remux
    };
    hls_config.merge_config.keep_segments = args.keep;

    // Two-stage interrupt: first Ctrl-C drains, second aborts.
    let stop = StopController::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing in-flight segments (Ctrl-C again to abort)");
                stop.stop();
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Second interrupt, aborting now");
                    stop.abort();
                }
            }
        });
    }

    let mut downloader = HlsDownloader::new(hls_config)?.with_stop_controller(stop);

    if let Some(key) = args.key.as_ref() {
        downloader = downloader.with_key_override(key.clone(), args.iv.clone());
    }

    let renderer = if args.show_progress {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        downloader = downloader.with_progress(tx);
        Some(progress::spawn_renderer(rx))
    } else {
        None
    };

    let summary = if args.live {
        downloader.download_live(&args.url, &args.output).await?
    } else {
        downloader.download_archive(&args.url, &args.output).await?
    };

    // Drop the downloader so the progress channel closes and the
    // renderer can finish.
    drop(downloader);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    info!(
        segments = summary.segments_completed,
        failed = summary.segments_failed,
        bytes = summary.bytes_downloaded,
        "Download finished"
    );
    match &summary.output {
        Some(path) => info!(output = %path.display(), "Output written"),
        None => warn!("No merged output was produced; segment files were kept"),
    }

    Ok(())
}
