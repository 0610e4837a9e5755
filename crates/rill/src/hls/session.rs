// Shared session machinery: phases, output layout, admission bookkeeping
// and the completion handoff.

use crate::hls::HlsDownloaderError;
use crate::hls::config::{HlsConfig, HlsMergeConfig};
use crate::hls::events::DownloadEvent;
use crate::hls::keys::ResolvedSource;
use crate::hls::merge::merge_segments;
use crate::hls::playlist::{MediaSnapshot, SnapshotSegment};
use crate::hls::scheduler::{CompletedSegment, SegmentEvent, SegmentJob};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

/// Lifecycle of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Resolving,
    Polling,
    Draining,
    Aborting,
}

/// Final accounting a session hands back to its caller.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Merged output file, when the handoff succeeded
    pub output: Option<PathBuf>,
    pub segments_completed: usize,
    pub segments_failed: usize,
    pub bytes_downloaded: u64,
}

/// Filesystem layout of a session: the destination file and the segment
/// temp directory next to it. The layout is a pure function of the
/// destination path so an interrupted archive can resume into the same
/// directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub output: PathBuf,
    pub temp_dir: PathBuf,
}

impl SessionPaths {
    pub fn for_output(output: &Path) -> Self {
        Self {
            output: output.to_path_buf(),
            temp_dir: PathBuf::from(format!("{}.parts", output.display())),
        }
    }

    pub async fn ensure_temp_dir(&self) -> Result<(), HlsDownloaderError> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        Ok(())
    }
}

/// Deterministic per-segment file name: admission index plus the last path
/// component of the URI, query stripped.
pub fn segment_filename(index: u64, uri: &str) -> String {
    let name = uri
        .split('?')
        .next()
        .unwrap_or(uri)
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("segment.ts");
    format!("{index:05}_{name}")
}

/// Identity of a segment for the dedup ledger. Byte-ranged segments share
/// a URI, so the range is part of the identity.
pub fn segment_identity(segment: &SnapshotSegment) -> String {
    match &segment.byte_range {
        Some(range) => format!("{}@{:?}+{}", segment.uri, range.offset, range.length),
        None => segment.uri.clone(),
    }
}

/// Diff a snapshot against the session dedup ledger, admitting each
/// segment identity at most once for the whole session. Each admitted
/// segment is paired with its media sequence number, derived from the
/// snapshot's `EXT-X-MEDIA-SEQUENCE` plus its position in the window.
pub fn collect_new_segments(
    snapshot: &MediaSnapshot,
    ledger: &mut HashSet<String>,
) -> Vec<(u64, SnapshotSegment)> {
    snapshot
        .segments
        .iter()
        .enumerate()
        .filter(|(_, s)| ledger.insert(segment_identity(s)))
        .map(|(i, s)| (snapshot.media_sequence + i as u64, s.clone()))
        .collect()
}

/// Live refresh sleep: the configured cap or the playlist target duration,
/// whichever is shorter.
pub fn refresh_delay(config: &HlsConfig, target_duration: u64) -> Duration {
    Duration::from_secs(target_duration.max(1)).min(config.playlist_config.live_refresh_cap)
}

/// Turn an admitted snapshot segment into a scheduler job. `index` is the
/// session admission position; `media_sequence` is the segment's playlist
/// sequence number, which drives IV derivation.
pub fn build_job(
    index: u64,
    media_sequence: u64,
    segment: &SnapshotSegment,
    resolved: &ResolvedSource,
) -> Result<SegmentJob, HlsDownloaderError> {
    let url = if segment.uri.starts_with("http://") || segment.uri.starts_with("https://") {
        Url::parse(&segment.uri)
    } else {
        resolved.url_prefix.join(&segment.uri)
    }
    .map_err(|e| {
        HlsDownloaderError::PlaylistError(format!(
            "Could not resolve segment URI {}: {e}",
            segment.uri
        ))
    })?;

    Ok(SegmentJob {
        index,
        media_sequence,
        url: url.to_string(),
        filename: segment_filename(index, &segment.uri),
        duration: segment.duration,
        byte_range: segment.byte_range.clone(),
    })
}

/// Per-session progress accounting, also the source of [`DownloadEvent`]s.
pub struct SessionProgress {
    start: Instant,
    completed: usize,
    failed: usize,
    bytes: u64,
    total: Option<usize>,
    tx: Option<mpsc::UnboundedSender<DownloadEvent>>,
}

impl SessionProgress {
    pub fn new(tx: Option<mpsc::UnboundedSender<DownloadEvent>>) -> Self {
        Self {
            start: Instant::now(),
            completed: 0,
            failed: 0,
            bytes: 0,
            total: None,
            tx,
        }
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = Some(total);
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn segments_admitted(&self, new_segments: usize, total_admitted: u64) {
        self.emit(DownloadEvent::SegmentsAdmitted {
            new_segments,
            total_admitted,
        });
    }

    /// Estimated time to completion from the average per-segment pace.
    /// Only meaningful when the total is known.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        if self.completed == 0 || total <= self.completed + self.failed {
            return None;
        }
        let remaining = (total - self.completed - self.failed) as u32;
        Some(self.start.elapsed() / self.completed as u32 * remaining)
    }

    /// Record one scheduler event and emit the matching progress event.
    pub fn record(&mut self, event: &SegmentEvent) {
        match event {
            SegmentEvent::Completed(c) => {
                self.completed += 1;
                self.bytes += c.bytes;
                self.emit(DownloadEvent::SegmentCompleted {
                    index: c.index,
                    bytes: c.bytes,
                    completed: self.completed,
                    total: self.total,
                    eta: self.eta(),
                });
            }
            SegmentEvent::Failed { index, url, .. } => {
                self.failed += 1;
                self.emit(DownloadEvent::SegmentFailed {
                    index: *index,
                    url: url.clone(),
                });
            }
        }
    }

    /// Account for a segment restored from a previous run without
    /// downloading it again.
    pub fn record_resumed(&mut self, segment: &CompletedSegment) {
        self.completed += 1;
        self.bytes += segment.bytes;
    }

    pub fn stream_ended(&self) {
        self.emit(DownloadEvent::StreamEnded);
    }

    pub fn summary(&self, output: Option<PathBuf>) -> SessionSummary {
        SessionSummary {
            output,
            segments_completed: self.completed,
            segments_failed: self.failed,
            bytes_downloaded: self.bytes,
        }
    }

    pub fn merging(&self, segments: usize) {
        self.emit(DownloadEvent::Merging { segments });
    }

    pub fn merged(&self, path: &Path) {
        self.emit(DownloadEvent::Merged {
            path: path.to_path_buf(),
        });
    }
}

/// Merge the completed segments into the destination file. Runs at most
/// once per session, after the scheduler has drained.
///
/// On merge failure the temp files are preserved and `None` is returned;
/// the session itself still counts as finished.
pub async fn finalize_session(
    completed: &BTreeMap<u64, CompletedSegment>,
    paths: &SessionPaths,
    merge_config: &HlsMergeConfig,
    progress: &SessionProgress,
) -> Option<PathBuf> {
    if completed.is_empty() {
        warn!("No segments completed, nothing to merge");
        return None;
    }

    // BTreeMap iteration gives admission order regardless of completion order.
    let ordered: Vec<PathBuf> = completed.values().map(|c| c.path.clone()).collect();
    progress.merging(ordered.len());

    match merge_segments(&ordered, &paths.output, merge_config.strategy).await {
        Ok(()) => {
            info!(output = %paths.output.display(), "Merge complete");
            progress.merged(&paths.output);
            if !merge_config.keep_segments {
                if let Err(e) = tokio::fs::remove_dir_all(&paths.temp_dir).await {
                    warn!(error = %e, "Failed to remove segment temp directory");
                }
            }
            Some(paths.output.clone())
        }
        Err(e) => {
            warn!(
                error = %e,
                temp_dir = %paths.temp_dir.display(),
                "Merge failed, segment files preserved"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::playlist::parse_media_snapshot;

    fn snapshot(uris: &[&str]) -> MediaSnapshot {
        let mut body = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
        for uri in uris {
            body.push_str(&format!("#EXTINF:4.0,\n{uri}\n"));
        }
        parse_media_snapshot(body.as_bytes()).unwrap()
    }

    #[test]
    fn overlapping_snapshots_admit_each_segment_once() {
        let mut ledger = HashSet::new();

        let first = collect_new_segments(&snapshot(&["a.ts", "b.ts", "c.ts"]), &mut ledger);
        assert_eq!(first.len(), 3);

        // Sliding window: b and c repeat, d and e are new.
        let second =
            collect_new_segments(&snapshot(&["b.ts", "c.ts", "d.ts", "e.ts"]), &mut ledger);
        let uris: Vec<&str> = second.iter().map(|(_, s)| s.uri.as_str()).collect();
        assert_eq!(uris, vec!["d.ts", "e.ts"]);

        // A stale window admits nothing.
        let third = collect_new_segments(&snapshot(&["c.ts", "d.ts"]), &mut ledger);
        assert!(third.is_empty());
    }

    #[test]
    fn admitted_segments_carry_their_media_sequence() {
        let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:120\n\
#EXTINF:4.0,\nseg120.ts\n\
#EXTINF:4.0,\nseg121.ts\n";
        let snapshot = parse_media_snapshot(body.as_bytes()).unwrap();

        let mut ledger = HashSet::new();
        let admitted = collect_new_segments(&snapshot, &mut ledger);
        let sequences: Vec<u64> = admitted.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences, vec![120, 121]);

        // A session joining mid-stream admits at index 0 but keeps the
        // playlist sequence for decryption.
        let resolved = ResolvedSource {
            decryption: None,
            url_prefix: Url::parse("https://cdn.example.com/live/").unwrap(),
        };
        let (sequence, segment) = &admitted[0];
        let job = build_job(0, *sequence, segment, &resolved).unwrap();
        assert_eq!(job.index, 0);
        assert_eq!(job.media_sequence, 120);
    }

    #[test]
    fn filenames_are_deterministic_and_ordered() {
        assert_eq!(
            segment_filename(0, "media_0.ts?token=abc"),
            "00000_media_0.ts"
        );
        assert_eq!(
            segment_filename(42, "https://cdn.example.com/live/media_42.ts"),
            "00042_media_42.ts"
        );
        assert_eq!(segment_filename(7, ""), "00007_segment.ts");
    }

    #[test]
    fn refresh_delay_is_capped() {
        let config = HlsConfig::default(); // cap 5s
        assert_eq!(refresh_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(refresh_delay(&config, 10), Duration::from_secs(5));
        assert_eq!(refresh_delay(&config, 0), Duration::from_secs(1));
    }

    #[test]
    fn jobs_resolve_relative_uris_against_the_prefix() {
        let resolved = ResolvedSource {
            decryption: None,
            url_prefix: Url::parse("https://cdn.example.com/live/").unwrap(),
        };
        let seg = SnapshotSegment {
            uri: "media_3.ts".to_string(),
            duration: 4.0,
            byte_range: None,
        };
        let job = build_job(3, 3, &seg, &resolved).unwrap();
        assert_eq!(job.url, "https://cdn.example.com/live/media_3.ts");
        assert_eq!(job.filename, "00003_media_3.ts");

        let absolute = SnapshotSegment {
            uri: "https://other.example.com/x.ts".to_string(),
            duration: 4.0,
            byte_range: None,
        };
        let job = build_job(4, 4, &absolute, &resolved).unwrap();
        assert_eq!(job.url, "https://other.example.com/x.ts");
    }

    #[test]
    fn eta_requires_known_total_and_progress() {
        let mut progress = SessionProgress::new(None);
        assert!(progress.eta().is_none());

        progress.set_total(10);
        assert!(progress.eta().is_none());

        progress.record(&SegmentEvent::Completed(CompletedSegment {
            index: 0,
            path: PathBuf::from("x"),
            bytes: 100,
            duration: 4.0,
        }));
        assert!(progress.eta().is_some());
        assert_eq!(progress.completed(), 1);
    }

    #[tokio::test]
    async fn finalize_merges_in_admission_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::for_output(&dir.path().join("out.ts"));
        paths.ensure_temp_dir().await.unwrap();

        // Insert completions out of order; the map orders by index.
        let mut completed = BTreeMap::new();
        for (index, content) in [(2u64, b"c"), (0, b"a"), (1, b"b")] {
            let path = paths.temp_dir.join(format!("{index:05}_seg.ts"));
            tokio::fs::write(&path, content).await.unwrap();
            completed.insert(
                index,
                CompletedSegment {
                    index,
                    path,
                    bytes: 1,
                    duration: 4.0,
                },
            );
        }

        let progress = SessionProgress::new(None);
        let merged = finalize_session(
            &completed,
            &paths,
            &HlsMergeConfig::default(),
            &progress,
        )
        .await;

        assert_eq!(merged, Some(paths.output.clone()));
        assert_eq!(tokio::fs::read(&paths.output).await.unwrap(), b"abc");
        // Temp directory is cleaned up after a successful merge.
        assert!(!paths.temp_dir.exists());
    }

    #[tokio::test]
    async fn failed_merge_preserves_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::for_output(&dir.path().join("out.ts"));
        paths.ensure_temp_dir().await.unwrap();

        // Completed entry pointing at a file that does not exist.
        let mut completed = BTreeMap::new();
        completed.insert(
            0u64,
            CompletedSegment {
                index: 0,
                path: paths.temp_dir.join("00000_gone.ts"),
                bytes: 1,
                duration: 4.0,
            },
        );

        let progress = SessionProgress::new(None);
        let merged = finalize_session(
            &completed,
            &paths,
            &HlsMergeConfig::default(),
            &progress,
        )
        .await;

        assert!(merged.is_none());
        assert!(paths.temp_dir.exists());
    }
}
