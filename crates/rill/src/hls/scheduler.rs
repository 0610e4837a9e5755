// HLS Segment Scheduler: bounded-concurrency download worker loop.
//
// Jobs arrive over an mpsc channel in admission order. The loop keeps at
// most `download_concurrency` fetch-decrypt-write operations in flight,
// re-queues retryable failures up to the configured attempt cap, and exits
// only when the input channel is closed and no work remains. Closing the
// input channel is the session's way of saying no more segments can ever
// arrive, so scheduler exit is the signal that the completion handoff may
// run. Events go out on an unbounded channel: the loop never blocks on a
// consumer, so a session can keep admitting segments while completions
// pile up.

use crate::hls::HlsDownloaderError;
use crate::hls::config::HlsConfig;
use crate::hls::decryption::{DecryptionContext, decrypt_aes128};
use crate::hls::fetcher::MediaFetcher;
use crate::shutdown::StopController;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// A segment admitted for download. `index` is the admission position and
/// is stable across retries.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub index: u64,
    /// Media sequence number of the segment, used for IV derivation when
    /// the playlist carries no explicit IV.
    pub media_sequence: u64,
    /// Absolute segment URL
    pub url: String,
    /// File name inside the session temp directory
    pub filename: String,
    pub duration: f32,
    pub byte_range: Option<m3u8_rs::ByteRange>,
}

#[derive(Debug, Clone)]
pub struct CompletedSegment {
    pub index: u64,
    pub path: PathBuf,
    pub bytes: u64,
    pub duration: f32,
}

/// Per-segment outcome reported to the session driver. Every admitted
/// segment produces exactly one event.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    Completed(CompletedSegment),
    Failed {
        index: u64,
        url: String,
        error: HlsDownloaderError,
    },
}

pub struct SegmentScheduler {
    config: Arc<HlsConfig>,
    fetcher: Arc<dyn MediaFetcher>,
    decryption: Option<DecryptionContext>,
    temp_dir: PathBuf,
    job_rx: mpsc::Receiver<SegmentJob>,
    output_tx: mpsc::UnboundedSender<SegmentEvent>,
    stop: StopController,
}

impl SegmentScheduler {
    pub fn new(
        config: Arc<HlsConfig>,
        fetcher: Arc<dyn MediaFetcher>,
        decryption: Option<DecryptionContext>,
        temp_dir: PathBuf,
        job_rx: mpsc::Receiver<SegmentJob>,
        output_tx: mpsc::UnboundedSender<SegmentEvent>,
        stop: StopController,
    ) -> Self {
        Self {
            config,
            fetcher,
            decryption,
            temp_dir,
            job_rx,
            output_tx,
            stop,
        }
    }

    /// One fetch-decrypt-write attempt for a job. Returns the job and its
    /// attempt counter so the loop can decide about a retry.
    async fn perform_attempt(
        fetcher: Arc<dyn MediaFetcher>,
        decryption: Option<DecryptionContext>,
        temp_dir: PathBuf,
        backoff_base: std::time::Duration,
        job: SegmentJob,
        attempt: u32,
    ) -> (SegmentJob, u32, Result<CompletedSegment, HlsDownloaderError>) {
        if attempt > 0 {
            let delay = backoff_base * 2_u32.pow(attempt.saturating_sub(1));
            tokio::time::sleep(delay).await;
        }

        let result = Self::fetch_decrypt_write(&*fetcher, decryption, &temp_dir, &job).await;
        (job, attempt, result)
    }

    async fn fetch_decrypt_write(
        fetcher: &dyn MediaFetcher,
        decryption: Option<DecryptionContext>,
        temp_dir: &std::path::Path,
        job: &SegmentJob,
    ) -> Result<CompletedSegment, HlsDownloaderError> {
        let url = Url::parse(&job.url).map_err(|e| {
            HlsDownloaderError::SegmentFetchError(format!("Invalid segment URL {}: {e}", job.url))
        })?;

        let raw = fetcher.fetch_bytes(&url, job.byte_range.as_ref()).await?;

        let data = match &decryption {
            Some(ctx) => decrypt_aes128(&raw, &ctx.key, &ctx.iv_for(job.media_sequence))?,
            None => raw,
        };

        let path = temp_dir.join(&job.filename);
        let bytes = data.len() as u64;
        tokio::fs::write(&path, &data).await?;

        debug!(index = job.index, bytes, path = %path.display(), "Segment written");
        Ok(CompletedSegment {
            index: job.index,
            path,
            bytes,
            duration: job.duration,
        })
    }

    pub async fn run(mut self) {
        info!("SegmentScheduler started");
        let concurrency = self.config.scheduler_config.download_concurrency.max(1);
        let max_attempts = self.config.fetcher_config.max_segment_retries.max(1);
        let backoff_base = self.config.fetcher_config.segment_retry_delay_base;

        let mut pending: VecDeque<(SegmentJob, u32)> = VecDeque::new();
        let mut in_flight = FuturesUnordered::new();
        let mut input_closed = false;

        loop {
            // Fill free download slots from the pending queue.
            while in_flight.len() < concurrency {
                let Some((job, attempt)) = pending.pop_front() else {
                    break;
                };
                in_flight.push(Self::perform_attempt(
                    Arc::clone(&self.fetcher),
                    self.decryption,
                    self.temp_dir.clone(),
                    backoff_base,
                    job,
                    attempt,
                ));
            }

            if input_closed && pending.is_empty() && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.stop.aborted() => {
                    info!("Abort requested, dropping in-flight segment downloads");
                    return;
                }

                maybe_job = self.job_rx.recv(), if !input_closed => {
                    match maybe_job {
                        Some(job) => {
                            debug!(index = job.index, url = %job.url, "Segment admitted");
                            pending.push_back((job, 0));
                        }
                        None => {
                            info!("Segment channel closed, draining remaining work");
                            input_closed = true;
                        }
                    }
                }

                Some((job, attempt, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(completed) => {
                            if self.output_tx.send(SegmentEvent::Completed(completed)).is_err() {
                                warn!("Output channel closed, stopping scheduler");
                                return;
                            }
                        }
                        Err(error) if error.is_retryable() && attempt + 1 < max_attempts => {
                            warn!(
                                index = job.index,
                                url = %job.url,
                                attempt = attempt + 1,
                                error = %error,
                                "Segment attempt failed, requeueing"
                            );
                            pending.push_back((job, attempt + 1));
                        }
                        Err(error) => {
                            warn!(index = job.index, url = %job.url, error = %error, "Segment failed permanently");
                            let event = SegmentEvent::Failed {
                                index: job.index,
                                url: job.url,
                                error,
                            };
                            if self.output_tx.send(event).is_err() {
                                warn!("Output channel closed, stopping scheduler");
                                return;
                            }
                        }
                    }
                }
            }
        }
        info!("SegmentScheduler finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher that replays a script of responses per URL.
    struct ScriptedFetcher {
        script: Mutex<HashMap<String, VecDeque<Result<Bytes, HlsDownloaderError>>>>,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }

        fn respond(&self, url: &str, result: Result<Bytes, HlsDownloaderError>) {
            self.script
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(result);
        }
    }

    #[async_trait]
    impl MediaFetcher for ScriptedFetcher {
        async fn fetch_bytes(
            &self,
            url: &Url,
            _byte_range: Option<&m3u8_rs::ByteRange>,
        ) -> Result<Bytes, HlsDownloaderError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let mut script = self.script.lock().unwrap();
            let queue = script.get_mut(url.as_str()).unwrap_or_else(|| {
                panic!("unexpected fetch of {url}");
            });
            queue.pop_front().unwrap_or(Ok(Bytes::from_static(b"tail")))
        }
    }

    fn retryable_error() -> HlsDownloaderError {
        HlsDownloaderError::HttpStatus {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            url: "x".into(),
        }
    }

    fn job(index: u64, name: &str) -> SegmentJob {
        SegmentJob {
            index,
            media_sequence: index,
            url: format!("https://cdn.example.com/live/{name}"),
            filename: format!("{index:05}_{name}"),
            duration: 4.0,
            byte_range: None,
        }
    }

    fn test_config(concurrency: usize, max_retries: u32) -> Arc<HlsConfig> {
        let mut config = HlsConfig::default();
        config.scheduler_config.download_concurrency = concurrency;
        config.fetcher_config.max_segment_retries = max_retries;
        config.fetcher_config.segment_retry_delay_base = std::time::Duration::from_millis(1);
        Arc::new(config)
    }

    async fn run_scheduler(
        fetcher: Arc<ScriptedFetcher>,
        config: Arc<HlsConfig>,
        jobs: Vec<SegmentJob>,
        temp_dir: &std::path::Path,
    ) -> Vec<SegmentEvent> {
        let (job_tx, job_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let scheduler = SegmentScheduler::new(
            config,
            fetcher,
            None,
            temp_dir.to_path_buf(),
            job_rx,
            out_tx,
            StopController::new(),
        );
        let handle = tokio::spawn(scheduler.run());

        for j in jobs {
            job_tx.send(j).await.unwrap();
        }
        drop(job_tx);

        let mut events = Vec::new();
        while let Some(ev) = out_rx.recv().await {
            events.push(ev);
        }
        handle.await.unwrap();
        events
    }

    #[tokio::test]
    async fn completes_all_segments_with_one_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://cdn.example.com/live/seg0.ts", Ok(Bytes::from_static(b"a")));
        fetcher.respond("https://cdn.example.com/live/seg1.ts", Err(retryable_error()));
        fetcher.respond("https://cdn.example.com/live/seg1.ts", Ok(Bytes::from_static(b"b")));
        fetcher.respond("https://cdn.example.com/live/seg2.ts", Ok(Bytes::from_static(b"c")));

        let events = run_scheduler(
            fetcher.clone(),
            test_config(2, 3),
            vec![job(0, "seg0.ts"), job(1, "seg1.ts"), job(2, "seg2.ts")],
            dir.path(),
        )
        .await;

        // Every admitted segment completed exactly once.
        let mut completed: Vec<u64> = events
            .iter()
            .map(|ev| match ev {
                SegmentEvent::Completed(c) => c.index,
                SegmentEvent::Failed { index, .. } => panic!("segment {index} failed"),
            })
            .collect();
        completed.sort_unstable();
        assert_eq!(completed, vec![0, 1, 2]);

        for name in ["00000_seg0.ts", "00001_seg1.ts", "00002_seg2.ts"] {
            assert!(dir.path().join(name).exists());
        }
        // The concurrency bound held.
        assert!(fetcher.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn retry_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        for _ in 0..3 {
            fetcher.respond("https://cdn.example.com/live/seg0.ts", Err(retryable_error()));
        }

        let events = run_scheduler(
            fetcher.clone(),
            test_config(1, 3),
            vec![job(0, "seg0.ts")],
            dir.path(),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SegmentEvent::Failed { index: 0, .. }));
        // Exactly max_segment_retries attempts were made.
        assert!(fetcher.script.lock().unwrap()["https://cdn.example.com/live/seg0.ts"].is_empty());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(
            "https://cdn.example.com/live/seg0.ts",
            Err(HlsDownloaderError::HttpStatus {
                status: reqwest::StatusCode::NOT_FOUND,
                url: "x".into(),
            }),
        );

        let events = run_scheduler(
            fetcher,
            test_config(1, 3),
            vec![job(0, "seg0.ts")],
            dir.path(),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SegmentEvent::Failed {
                error: HlsDownloaderError::HttpStatus { status, .. },
                ..
            } if *status == reqwest::StatusCode::NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn admission_is_not_blocked_by_unread_completion_events() {
        // The producer sends far more jobs than any channel buffer holds
        // while nobody reads completion events. Admission must still
        // finish; events are drained only afterwards.
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://cdn.example.com/live/seg.ts", Ok(Bytes::from_static(b"a")));

        let (job_tx, job_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let scheduler = SegmentScheduler::new(
            test_config(4, 3),
            fetcher,
            None,
            dir.path().to_path_buf(),
            job_rx,
            out_tx,
            StopController::new(),
        );
        let handle = tokio::spawn(scheduler.run());

        for i in 0..200 {
            job_tx.send(job(i, "seg.ts")).await.unwrap();
        }
        drop(job_tx);
        handle.await.unwrap();

        let mut completed = 0;
        while let Some(ev) = out_rx.recv().await {
            assert!(matches!(ev, SegmentEvent::Completed(_)));
            completed += 1;
        }
        assert_eq!(completed, 200);
    }

    #[tokio::test]
    async fn decryption_derives_the_iv_from_the_media_sequence() {
        use crate::hls::decryption::sequence_iv;
        use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
        type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

        // Ciphertext produced with the IV of media sequence 120; a session
        // joining mid-stream must decrypt with that sequence, not with its
        // own admission position.
        let key = [0x24u8; 16];
        let plaintext = b"mid-stream segment payload";
        let mut buffer = vec![0u8; plaintext.len() + 16];
        let ciphertext = Aes128CbcEnc::new_from_slices(&key, &sequence_iv(120))
            .unwrap()
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut buffer)
            .unwrap()
            .to_vec();

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://cdn.example.com/live/seg120.ts", Ok(Bytes::from(ciphertext)));

        let (job_tx, job_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let scheduler = SegmentScheduler::new(
            test_config(1, 1),
            fetcher,
            Some(DecryptionContext { key, iv: None }),
            dir.path().to_path_buf(),
            job_rx,
            out_tx,
            StopController::new(),
        );
        let handle = tokio::spawn(scheduler.run());

        let mut admitted = job(0, "seg120.ts");
        admitted.media_sequence = 120;
        job_tx.send(admitted).await.unwrap();
        drop(job_tx);

        let event = out_rx.recv().await.unwrap();
        let SegmentEvent::Completed(c) = event else {
            panic!("segment failed to decrypt");
        };
        handle.await.unwrap();

        let written = tokio::fs::read(&c.path).await.unwrap();
        assert_eq!(written, plaintext);
    }

    #[tokio::test]
    async fn abort_drops_pending_work() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond("https://cdn.example.com/live/seg0.ts", Ok(Bytes::from_static(b"a")));

        let (job_tx, job_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let stop = StopController::new();
        stop.abort();
        let scheduler = SegmentScheduler::new(
            test_config(1, 3),
            fetcher,
            None,
            dir.path().to_path_buf(),
            job_rx,
            out_tx,
            stop,
        );
        let handle = tokio::spawn(scheduler.run());
        job_tx.send(job(0, "seg0.ts")).await.unwrap();
        drop(job_tx);

        handle.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }
}
