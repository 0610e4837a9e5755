use indicatif::{ProgressBar, ProgressStyle};
use rill_engine::hls::DownloadEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Render engine progress events as an indicatif bar.
///
/// Live sessions have no known total, so the bar starts as a spinner and
/// switches to a real bar once an archive session reports its plan size.
pub fn spawn_renderer(mut rx: mpsc::UnboundedReceiver<DownloadEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {pos} segments {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        let mut sized = false;

        while let Some(event) = rx.recv().await {
            match event {
                DownloadEvent::SegmentsAdmitted { total_admitted, .. } => {
                    if !sized {
                        bar.set_message(format!("({total_admitted} admitted)"));
                    }
                }
                DownloadEvent::SegmentCompleted {
                    completed,
                    total,
                    eta,
                    ..
                } => {
                    if let Some(total) = total {
                        if !sized {
                            bar.set_length(total as u64);
                            bar.set_style(
                                ProgressStyle::with_template(
                                    "[{bar:40}] {pos}/{len} segments {msg}",
                                )
                                .unwrap_or_else(|_| ProgressStyle::default_bar()),
                            );
                            sized = true;
                        }
                    }
                    bar.set_position(completed as u64);
                    match eta {
                        Some(eta) => bar.set_message(format!("ETA {}s", eta.as_secs())),
                        None => bar.set_message(String::new()),
                    }
                }
                DownloadEvent::SegmentFailed { index, .. } => {
                    bar.set_message(format!("segment {index} failed"));
                }
                DownloadEvent::StreamEnded => {
                    bar.set_message("stream ended, draining".to_string());
                }
                DownloadEvent::Merging { segments } => {
                    bar.set_message(format!("merging {segments} segments"));
                }
                DownloadEvent::Merged { path } => {
                    bar.finish_with_message(format!("merged into {}", path.display()));
                }
            }
        }
        if !bar.is_finished() {
            bar.finish_and_clear();
        }
    })
}
