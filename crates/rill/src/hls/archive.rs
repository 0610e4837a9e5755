// Archive session driver: one playlist fetch, one batch of jobs, one
// drain, one merge. Supports resuming into an existing temp directory.

use crate::hls::HlsDownloaderError;
use crate::hls::config::HlsConfig;
use crate::hls::fetcher::MediaFetcher;
use crate::hls::keys::{KeyResolverRegistry, KeySource, ResolvedSource};
use crate::hls::playlist::{MediaSnapshot, PlaylistEngine};
use crate::hls::scheduler::{CompletedSegment, SegmentEvent, SegmentJob, SegmentScheduler};
use crate::hls::session::{
    SessionPaths, SessionPhase, SessionProgress, SessionSummary, build_job, segment_filename,
};
use crate::shutdown::StopController;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Download plan for a bounded playlist: jobs still to fetch plus segments
/// restored from a previous run.
pub struct ArchivePlan {
    pub jobs: Vec<SegmentJob>,
    pub resumed: Vec<CompletedSegment>,
    pub total: usize,
}

/// Build the plan for a snapshot. A segment is skipped when its output
/// file already exists with a non-zero size; filenames are deterministic,
/// so a rerun against the same destination finds its own leftovers.
pub fn plan_archive(
    snapshot: &MediaSnapshot,
    resolved: &ResolvedSource,
    temp_dir: &Path,
) -> Result<ArchivePlan, HlsDownloaderError> {
    let mut jobs = Vec::new();
    let mut resumed = Vec::new();

    for (i, segment) in snapshot.segments.iter().enumerate() {
        let index = i as u64;
        let path = temp_dir.join(segment_filename(index, &segment.uri));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                debug!(index, path = %path.display(), "Segment already on disk, skipping");
                resumed.push(CompletedSegment {
                    index,
                    path,
                    bytes: meta.len(),
                    duration: segment.duration,
                });
            }
            _ => jobs.push(build_job(
                index,
                snapshot.media_sequence + index,
                segment,
                resolved,
            )?),
        }
    }

    Ok(ArchivePlan {
        jobs,
        resumed,
        total: snapshot.segments.len(),
    })
}

/// Overall budget for one archive drive: target duration times segment
/// count, floored so short playlists are not starved.
pub fn session_timeout(snapshot: &MediaSnapshot) -> Duration {
    let secs = snapshot.target_duration * snapshot.segments.len() as u64;
    Duration::from_secs(secs).max(MIN_SESSION_TIMEOUT)
}

pub struct ArchiveSession {
    config: Arc<HlsConfig>,
    playlist: PlaylistEngine,
    fetcher: Arc<dyn MediaFetcher>,
    registry: KeyResolverRegistry,
    paths: SessionPaths,
    stop: StopController,
    progress: SessionProgress,
    url: String,
    phase: SessionPhase,
}

impl ArchiveSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<HlsConfig>,
        playlist: PlaylistEngine,
        fetcher: Arc<dyn MediaFetcher>,
        registry: KeyResolverRegistry,
        paths: SessionPaths,
        stop: StopController,
        progress: SessionProgress,
        url: String,
    ) -> Self {
        Self {
            config,
            playlist,
            fetcher,
            registry,
            paths,
            stop,
            progress,
            url,
            phase: SessionPhase::Init,
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        debug!(from = ?self.phase, to = ?phase, "Session phase transition");
        self.phase = phase;
    }

    async fn aborted(
        mut self,
        scheduler_task: JoinHandle<()>,
    ) -> Result<SessionSummary, HlsDownloaderError> {
        self.set_phase(SessionPhase::Aborting);
        warn!(temp_dir = %self.paths.temp_dir.display(), "Session aborted, segment files left for resume");
        let _ = scheduler_task.await;
        Err(HlsDownloaderError::Cancelled)
    }

    pub async fn run(mut self) -> Result<SessionSummary, HlsDownloaderError> {
        self.paths.ensure_temp_dir().await?;

        self.set_phase(SessionPhase::Resolving);
        let handle = self.playlist.load(&self.url).await?;
        if !handle.snapshot.end_list {
            info!("Playlist has no ENDLIST; downloading the window as-is");
        }
        let source = KeySource {
            manifest_url: handle.url.clone(),
            base_url: handle.base_url.clone(),
            key: handle.snapshot.key.clone(),
        };
        let resolved = self.registry.resolve(&source).await?;

        let plan = plan_archive(&handle.snapshot, &resolved, &self.paths.temp_dir)?;
        self.progress.set_total(plan.total);
        if !plan.resumed.is_empty() {
            info!(
                resumed = plan.resumed.len(),
                remaining = plan.jobs.len(),
                "Resuming into existing segment directory"
            );
        }

        let mut completed: BTreeMap<u64, CompletedSegment> = BTreeMap::new();
        for segment in plan.resumed {
            self.progress.record_resumed(&segment);
            completed.insert(segment.index, segment);
        }

        let (job_tx, job_rx) = mpsc::channel(plan.jobs.len().max(1));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let scheduler = SegmentScheduler::new(
            Arc::clone(&self.config),
            Arc::clone(&self.fetcher),
            resolved.decryption,
            self.paths.temp_dir.clone(),
            job_rx,
            event_tx,
            self.stop.clone(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        self.set_phase(SessionPhase::Polling);
        let job_count = plan.jobs.len();
        for job in plan.jobs {
            if job_tx.send(job).await.is_err() {
                warn!("Scheduler stopped accepting jobs");
                break;
            }
        }
        self.progress
            .segments_admitted(job_count, plan.total as u64);
        drop(job_tx);

        // Drain under the session budget.
        self.set_phase(SessionPhase::Draining);
        let deadline = tokio::time::Instant::now() + session_timeout(&handle.snapshot);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.aborted() => {
                    return self.aborted(scheduler_task).await;
                }
                _ = self.stop.stopped() => {
                    // Graceful interrupt: keep what we have, rerun later
                    // to resume from the same temp directory.
                    info!("Stop requested, archive can be resumed with the same output path");
                    self.stop.abort();
                    let _ = scheduler_task.await;
                    return Ok(self.progress.summary(None));
                }
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.progress.record(&event);
                            if let SegmentEvent::Completed(c) = event {
                                completed.insert(c.index, c);
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.stop.abort();
                    let _ = scheduler_task.await;
                    return Err(HlsDownloaderError::TimeoutError(format!(
                        "Archive session exceeded its budget of {:?}",
                        session_timeout(&handle.snapshot)
                    )));
                }
            }
        }
        let _ = scheduler_task.await;

        if self.progress.failed() > 0 {
            // Exhausted segments are fatal for an archive; a rerun can
            // retry just the missing pieces.
            return Err(HlsDownloaderError::SegmentFetchError(format!(
                "{} segment(s) failed permanently; completed files kept in {}",
                self.progress.failed(),
                self.paths.temp_dir.display()
            )));
        }

        let merged = crate::hls::session::finalize_session(
            &completed,
            &self.paths,
            &self.config.merge_config,
            &self.progress,
        )
        .await;
        Ok(self.progress.summary(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::playlist::parse_media_snapshot;
    use url::Url;

    fn vod_snapshot() -> MediaSnapshot {
        let body = "#EXTM3U\n\
#EXT-X-TARGETDURATION:6\n\
#EXTINF:6.0,\nseg0.ts\n\
#EXTINF:6.0,\nseg1.ts\n\
#EXTINF:6.0,\nseg2.ts\n\
#EXT-X-ENDLIST\n";
        parse_media_snapshot(body.as_bytes()).unwrap()
    }

    fn clear_source() -> ResolvedSource {
        ResolvedSource {
            decryption: None,
            url_prefix: Url::parse("https://cdn.example.com/vod/").unwrap(),
        }
    }

    #[test]
    fn plan_covers_every_segment_when_temp_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan_archive(&vod_snapshot(), &clear_source(), dir.path()).unwrap();
        assert_eq!(plan.total, 3);
        assert_eq!(plan.jobs.len(), 3);
        assert!(plan.resumed.is_empty());
        assert_eq!(plan.jobs[0].index, 0);
        assert_eq!(plan.jobs[2].media_sequence, 2);
        assert_eq!(plan.jobs[2].url, "https://cdn.example.com/vod/seg2.ts");
    }

    #[test]
    fn plan_skips_existing_non_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("00001_seg1.ts"), b"data").unwrap();
        // Zero-byte leftovers are refetched.
        std::fs::write(dir.path().join("00002_seg2.ts"), b"").unwrap();

        let plan = plan_archive(&vod_snapshot(), &clear_source(), dir.path()).unwrap();
        let job_indexes: Vec<u64> = plan.jobs.iter().map(|j| j.index).collect();
        assert_eq!(job_indexes, vec![0, 2]);
        assert_eq!(plan.resumed.len(), 1);
        assert_eq!(plan.resumed[0].index, 1);
        assert_eq!(plan.resumed[0].bytes, 4);
    }

    #[test]
    fn session_timeout_scales_with_playlist_size() {
        let snapshot = vod_snapshot();
        // 6s target x 3 segments is under the floor.
        assert_eq!(session_timeout(&snapshot), Duration::from_secs(60));

        let mut long = snapshot.clone();
        long.segments = (0..100)
            .map(|i| crate::hls::playlist::SnapshotSegment {
                uri: format!("seg{i}.ts"),
                duration: 6.0,
                byte_range: None,
            })
            .collect();
        assert_eq!(session_timeout(&long), Duration::from_secs(600));
    }
}
