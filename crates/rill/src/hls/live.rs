// Live session driver: poll the playlist, admit unseen segments, drain,
// then hand off to the merge step.

use crate::hls::HlsDownloaderError;
use crate::hls::config::HlsConfig;
use crate::hls::fetcher::MediaFetcher;
use crate::hls::keys::{KeyResolverRegistry, KeySource};
use crate::hls::playlist::PlaylistEngine;
use crate::hls::scheduler::{CompletedSegment, SegmentEvent, SegmentScheduler};
use crate::hls::session::{
    SessionPaths, SessionPhase, SessionProgress, SessionSummary, build_job, collect_new_segments,
    finalize_session, refresh_delay,
};
use crate::shutdown::StopController;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const JOB_CHANNEL_CAPACITY: usize = 64;

/// One live recording session.
///
/// Phase machine: `Init` (layout setup) -> `Resolving` (first manifest +
/// key resolution) -> `Polling` (cycle: refresh, dedup, admit, sleep) ->
/// `Draining` (admission closed, scheduler empties) -> handoff. A forced
/// abort moves to `Aborting` from any phase. `end_list` is latched: once
/// the playlist ends the session never returns to `Polling`.
pub struct LiveSession {
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

impl LiveSession {
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
        warn!(temp_dir = %self.paths.temp_dir.display(), "Session aborted, segment files left on disk");
        let _ = scheduler_task.await;
        Err(HlsDownloaderError::Cancelled)
    }

    pub async fn run(mut self) -> Result<SessionSummary, HlsDownloaderError> {
        self.paths.ensure_temp_dir().await?;

        self.set_phase(SessionPhase::Resolving);
        let handle = self.playlist.load(&self.url).await?;
        let source = KeySource {
            manifest_url: handle.url.clone(),
            base_url: handle.base_url.clone(),
            key: handle.snapshot.key.clone(),
        };
        // Resolved once; terminal on UnsupportedSource.
        let resolved = self.registry.resolve(&source).await?;

        let (job_tx, job_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        // Events are unbounded: the scheduler keeps consuming jobs even
        // while this loop is busy admitting, so a full job channel always
        // drains on its own.
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
        let mut ledger: HashSet<String> = HashSet::new();
        let mut completed: BTreeMap<u64, CompletedSegment> = BTreeMap::new();
        let mut snapshot = handle.snapshot.clone();
        let mut next_index: u64 = 0;
        let mut last_body: Option<Bytes> = None;
        let mut refresh_failures: u32 = 0;
        let mut ended = false;

        'poll: loop {
            let new_segments = collect_new_segments(&snapshot, &mut ledger);
            if !new_segments.is_empty() {
                let count = new_segments.len();
                for (sequence, segment) in new_segments {
                    let job = build_job(next_index, sequence, &segment, &resolved)?;
                    next_index += 1;
                    if job_tx.send(job).await.is_err() {
                        warn!("Scheduler stopped accepting jobs");
                        break 'poll;
                    }
                }
                self.progress.segments_admitted(count, next_index);
            }

            if snapshot.end_list {
                // Latched: the stream is over, no further polling.
                info!("Playlist carries ENDLIST, stream has ended");
                ended = true;
                break;
            }

            // Sleep until the next refresh, consuming completion events
            // and watching for shutdown while we wait.
            let deadline =
                tokio::time::Instant::now() + refresh_delay(&self.config, snapshot.target_duration);
            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.aborted() => {
                        return self.aborted(scheduler_task).await;
                    }
                    _ = self.stop.stopped() => {
                        info!("Stop requested, closing segment admission");
                        break 'poll;
                    }
                    maybe_event = event_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                self.progress.record(&event);
                                if let SegmentEvent::Completed(c) = event {
                                    completed.insert(c.index, c);
                                }
                            }
                            None => break 'poll,
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            match self.playlist.refresh(&handle.url, &mut last_body).await {
                Ok(Some(new_snapshot)) => {
                    refresh_failures = 0;
                    snapshot = new_snapshot;
                }
                Ok(None) => {
                    refresh_failures = 0;
                }
                Err(e) => {
                    refresh_failures += 1;
                    warn!(
                        error = %e,
                        consecutive = refresh_failures,
                        "Playlist refresh failed"
                    );
                    if refresh_failures > self.config.playlist_config.live_max_refresh_retries {
                        self.stop.abort();
                        let _ = scheduler_task.await;
                        return Err(e);
                    }
                }
            }
        }

        // Admission is closed; the scheduler drains what remains.
        self.set_phase(SessionPhase::Draining);
        drop(job_tx);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.aborted() => {
                    return self.aborted(scheduler_task).await;
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
            }
        }
        let _ = scheduler_task.await;

        if ended {
            self.progress.stream_ended();
        }
        if self.progress.failed() > 0 {
            // A live window cannot be refetched later; the merge proceeds
            // without the lost segments.
            warn!(
                failed = self.progress.failed(),
                "Some segments were lost and are excluded from the output"
            );
        }

        let merged = finalize_session(
            &completed,
            &self.paths,
            &self.config.merge_config,
            &self.progress,
        )
        .await;

        Ok(self.progress.summary(merged))
    }
}
