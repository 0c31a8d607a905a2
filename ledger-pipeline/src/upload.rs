//! C4 Upload Queue.
//!
//! A single queue, M concurrent uploader tasks, two-axis (count + bytes)
//! backpressure, and per-file retry with exponential-plus-jitter backoff --
//! modeled on the teacher's `HttpEventSink` background-thread-with-retry
//! shape (`http_event_sink.rs`), adapted to tokio tasks since the rest of
//! this pipeline is async, and using `tokio_retry2::Retry::spawn` exactly
//! as `push_block` does. The two-axis backpressure itself is new relative
//! to the teacher (which only tracks a count via `max_queue_size`); see
//! `DESIGN.md`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ledger_blobstore::BlobStore;
use ledger_model::error::{is_transient_message, is_transient_status};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_retry2::strategy::{ExponentialBackoff, jitter};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub bytes: u64,
    /// Whether to delete the local file when every retry is exhausted.
    /// Defaults to `false` (keep) per the open question in §9: "whether to
    /// delete locally-written files after a terminal upload failure
    /// defaults to *keep*".
    pub delete_on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UploadQueueConfig {
    pub concurrency: usize,
    pub high_count: i64,
    pub low_count: i64,
    pub high_bytes: i64,
    pub low_bytes: i64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_cap_ms: u64,
}

impl Default for UploadQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            high_count: 64,
            low_count: 16,
            high_bytes: 256 * 1024 * 1024,
            low_bytes: 64 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_cap_ms: 30_000,
        }
    }
}

struct Shared {
    store: BlobStore,
    config: UploadQueueConfig,
    queue_len: AtomicI64,
    queue_bytes: AtomicI64,
    in_flight: AtomicI64,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl Shared {
    /// Recomputes the latched pause flag with hysteresis: pause once
    /// either axis crosses its high-water mark, resume only once both axes
    /// are back under their low-water marks.
    fn update_pause_state(&self) {
        let len = self.queue_len.load(Ordering::SeqCst);
        let bytes = self.queue_bytes.load(Ordering::SeqCst);
        let was_paused = self.paused.load(Ordering::SeqCst);
        if !was_paused && (len >= self.config.high_count || bytes >= self.config.high_bytes) {
            self.paused.store(true, Ordering::SeqCst);
            warn!("upload queue pausing: queue_len={len} queue_bytes={bytes}");
        } else if was_paused && len <= self.config.low_count && bytes <= self.config.low_bytes {
            self.paused.store(false, Ordering::SeqCst);
            info!("upload queue resuming: queue_len={len} queue_bytes={bytes}");
        }
    }
}

/// Process-scoped background service: construct with [`UploadQueue::spawn`],
/// call [`UploadQueue::shutdown`] during interrupt handling.
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::UnboundedSender<UploadJob>,
    shared: Arc<Shared>,
}

impl UploadQueue {
    pub fn spawn(store: BlobStore, config: UploadQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<UploadJob>();
        let shared = Arc::new(Shared {
            store,
            config: config.clone(),
            queue_len: AtomicI64::new(0),
            queue_bytes: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            dead_letters: Mutex::new(Vec::new()),
        });
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..config.concurrency.max(1) {
            let rx = rx.clone();
            let shared = shared.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    shared.queue_len.fetch_sub(1, Ordering::SeqCst);
                    shared.queue_bytes.fetch_sub(job.bytes as i64, Ordering::SeqCst);
                    shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    shared.update_pause_state();
                    process_job(worker_id, &shared, job).await;
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    shared.update_pause_state();
                }
            });
        }
        Self { tx, shared }
    }

    /// Never blocks. Returns an error only once [`UploadQueue::shutdown`]
    /// has been called.
    pub fn enqueue(&self, job: UploadJob) -> Result<(), String> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err("upload queue is shutting down".to_string());
        }
        self.shared.queue_len.fetch_add(1, Ordering::SeqCst);
        self.shared.queue_bytes.fetch_add(job.bytes as i64, Ordering::SeqCst);
        self.shared.update_pause_state();
        self.tx.send(job).map_err(|e| e.to_string())
    }

    /// Two-axis backpressure signal producers must honor: poll before the
    /// next fetch/encode and yield while `true`.
    pub fn should_pause(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Blocks until both in-flight and queued counts reach zero.
    pub async fn drain(&self) {
        loop {
            if self.shared.queue_len.load(Ordering::SeqCst) == 0 && self.shared.in_flight.load(Ordering::SeqCst) == 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Latches a flag rejecting further enqueues, then drains.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.drain().await;
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.dead_letters.lock().await.clone()
    }

    pub async fn has_dead_letters(&self) -> bool {
        !self.shared.dead_letters.lock().await.is_empty()
    }
}

async fn process_job(worker_id: usize, shared: &Shared, job: UploadJob) {
    let cfg = &shared.config;
    let strategy = ExponentialBackoff::from_millis(cfg.retry_base_delay_ms.max(1))
        .factor(2)
        .max_delay(Duration::from_millis(cfg.retry_cap_ms))
        .map(jitter)
        .take(cfg.max_retries);

    let local_path = job.local_path.clone();
    let remote_path = job.remote_path.clone();
    let store = shared.store.clone();

    let result = Retry::spawn(strategy, || {
        let store = store.clone();
        let local_path = local_path.clone();
        let remote_path = remote_path.clone();
        async move { attempt_upload(&store, &local_path, &remote_path).await }
    })
    .await;

    match result {
        Ok(()) => {
            debug!("worker {worker_id} uploaded {} -> {}", local_path.display(), remote_path);
            if let Err(e) = tokio::fs::remove_file(&local_path).await {
                warn!("worker {worker_id} failed to delete uploaded local file {}: {e}", local_path.display());
            }
        }
        Err(e) => {
            error!("worker {worker_id} permanently failed to upload {}: {e}", local_path.display());
            if job.delete_on_failure
                && let Err(del_err) = tokio::fs::remove_file(&local_path).await
            {
                warn!("worker {worker_id} failed to delete {} after terminal failure: {del_err}", local_path.display());
            }
            shared.dead_letters.lock().await.push(DeadLetter {
                local_path,
                remote_path,
                error: e.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

async fn attempt_upload(store: &BlobStore, local_path: &PathBuf, remote_path: &str) -> Result<(), RetryError<String>> {
    let bytes = tokio::fs::read(local_path)
        .await
        .map_err(|e| RetryError::permanent(format!("reading {}: {e}", local_path.display())))?;
    match store.put(remote_path, Bytes::from(bytes)).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let msg = format!("{e:#}");
            if is_transient_upload_error(&msg) {
                Err(RetryError::transient(msg))
            } else {
                Err(RetryError::permanent(msg))
            }
        }
    }
}

/// Network-level transients use the same message classifier the fetcher
/// (C6) uses; store errors additionally carry status-code-shaped text for
/// 429/5xx which we match directly since `object_store` does not expose a
/// typed status code for every backend.
fn is_transient_upload_error(msg: &str) -> bool {
    if is_transient_message(msg) {
        return true;
    }
    for status in [429u16, 500, 502, 503, 504] {
        if is_transient_status(status) && msg.contains(&status.to_string()) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()), object_store::path::Path::from(""))
    }

    async fn local_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn successful_upload_deletes_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = local_file(&dir, "a.parquet", b"hello").await;
        let queue = UploadQueue::spawn(store(), UploadQueueConfig::default());
        queue
            .enqueue(UploadJob {
                local_path: path.clone(),
                remote_path: "backfill/updates/migration=1/year=2025/month=1/day=1/a.parquet".to_string(),
                bytes: 5,
                delete_on_failure: false,
            })
            .unwrap();
        queue.drain().await;
        assert!(!path.exists());
        assert!(!queue.has_dead_letters().await);
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_empty() {
        let queue = UploadQueue::spawn(store(), UploadQueueConfig::default());
        queue.drain().await;
    }

    #[tokio::test]
    async fn pause_resume_hysteresis() {
        let mut cfg = UploadQueueConfig::default();
        cfg.high_count = 2;
        cfg.low_count = 0;
        cfg.high_bytes = i64::MAX;
        cfg.low_bytes = i64::MAX;
        let queue = UploadQueue::spawn(store(), cfg);
        assert!(!queue.should_pause());

        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            let path = local_file(&dir, &format!("f{i}.parquet"), b"x").await;
            queue
                .enqueue(UploadJob {
                    local_path: path,
                    remote_path: format!("p/f{i}.parquet"),
                    bytes: 1,
                    delete_on_failure: false,
                })
                .unwrap();
        }
        // Whether we observe `paused` here is timing-dependent (workers may
        // have already drained the queue); the invariant we actually care
        // about is that it's never stuck paused once drained.
        queue.drain().await;
        assert!(!queue.should_pause());
    }

    #[tokio::test]
    async fn missing_local_file_is_a_terminal_failure() {
        let queue = UploadQueue::spawn(store(), UploadQueueConfig::default());
        queue
            .enqueue(UploadJob {
                local_path: PathBuf::from("/nonexistent/path/does-not-exist.parquet"),
                remote_path: "p/missing.parquet".to_string(),
                bytes: 0,
                delete_on_failure: false,
            })
            .unwrap();
        queue.drain().await;
        assert!(queue.has_dead_letters().await);
    }

    #[tokio::test]
    async fn shutdown_rejects_further_enqueues() {
        let queue = UploadQueue::spawn(store(), UploadQueueConfig::default());
        queue.shutdown().await;
        let dir = tempfile::tempdir().unwrap();
        let path = local_file(&dir, "late.parquet", b"x").await;
        assert!(
            queue
                .enqueue(UploadJob {
                    local_path: path,
                    remote_path: "p/late.parquet".to_string(),
                    bytes: 1,
                    delete_on_failure: false,
                })
                .is_err()
        );
    }
}
