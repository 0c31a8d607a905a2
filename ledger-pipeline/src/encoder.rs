//! C3 Encoder/Compressor Pool.
//!
//! A fixed pool of worker tasks draining one bounded job queue; `submit`
//! yields once the queue is full, which is this component's entire
//! backpressure contract. Each job produces exactly one physical Parquet
//! file plus a secondary length-prefixed zstd-chunked container; rows are
//! never split across workers mid-batch, and a worker never leaves a
//! partial file on disk (write-temp-then-rename, the same discipline the
//! cursor store uses for its own commit point).

use arrow::record_batch::RecordBatch;
use ledger_model::IngestError;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::{WriterProperties, WriterVersion};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{error, warn};

const MAX_WORKER_RETRIES: u32 = 3;

/// `(target_file_path, batch_of_rows, compression_level)` per §4.3. The
/// kind (updates/events/acs) is already baked into `target_file_path`'s
/// extension-free stem; the encoder doesn't need to know it.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub target_file_path: PathBuf,
    pub batch: RecordBatch,
    pub zstd_level: i32,
}

#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub parquet_path: PathBuf,
    pub parquet_bytes: u64,
    pub chunked_path: PathBuf,
    pub chunked_bytes: u64,
}

struct QueuedJob {
    job: EncodeJob,
    reply: oneshot::Sender<Result<EncodeOutcome, IngestError>>,
}

/// Process-scoped service with explicit construction and shutdown, per the
/// "shared singletons as services, not globals" design note -- callers hold
/// an `Arc<EncoderPool>` (or a plain clone, since it's already cheaply
/// `Clone`) rather than reaching for a `lazy_static`.
#[derive(Clone)]
pub struct EncoderPool {
    tx: mpsc::Sender<QueuedJob>,
    shutting_down: Arc<AtomicBool>,
}

impl EncoderPool {
    /// Spawns `num_workers` tasks sharing one bounded channel of capacity
    /// `queue_capacity`.
    pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..num_workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let queued = rx.lock().await.recv().await;
                    let Some(QueuedJob { job, reply }) = queued else {
                        break;
                    };
                    let result = encode_with_retries(worker_id, job).await;
                    let _ = reply.send(result);
                }
            });
        }
        Self {
            tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submits a job and waits for the worker to confirm both files exist
    /// locally. Blocks (yields) once the queue is at capacity -- this is
    /// C3's backpressure.
    pub async fn submit(&self, job: EncodeJob) -> Result<EncodeOutcome, IngestError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(IngestError::Encode("encoder pool is shut down".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueuedJob { job, reply: reply_tx })
            .await
            .map_err(|_| IngestError::Encode("encoder pool is shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| IngestError::Encode("encoder worker dropped without replying".into()))?
    }

    /// Latches a flag rejecting further `submit` calls. Any clone of this
    /// pool observes the same flag, since all components share one
    /// `Arc<EncoderPool>` handle per the "shared singletons as services"
    /// design note -- dropping one clone's channel sender would not, by
    /// itself, stop the others from enqueuing more work.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}

async fn encode_with_retries(worker_id: usize, job: EncodeJob) -> Result<EncodeOutcome, IngestError> {
    let mut last_err = None;
    for attempt in 1..=MAX_WORKER_RETRIES {
        let target = job.target_file_path.clone();
        let batch = job.batch.clone();
        let level = job.zstd_level;
        match tokio::task::spawn_blocking(move || encode_one(&target, &batch, level)).await {
            Ok(Ok(outcome)) => return Ok(outcome),
            Ok(Err(e)) => {
                warn!("encoder worker {worker_id} attempt {attempt}/{MAX_WORKER_RETRIES} failed: {e:#}");
                last_err = Some(IngestError::Encode(e.to_string()));
            }
            Err(join_err) => {
                warn!("encoder worker {worker_id} attempt {attempt}/{MAX_WORKER_RETRIES} panicked: {join_err}");
                last_err = Some(IngestError::Encode(format!("worker panicked: {join_err}")));
            }
        }
    }
    error!(
        "encoder worker {worker_id} exhausted {MAX_WORKER_RETRIES} attempts on {}",
        job.target_file_path.display()
    );
    Err(last_err.unwrap_or_else(|| IngestError::Encode("unknown encode failure".into())))
}

fn encode_one(target: &Path, batch: &RecordBatch, zstd_level: i32) -> anyhow::Result<EncodeOutcome> {
    let parquet_path = target.with_extension("parquet");
    write_parquet_atomically(&parquet_path, batch)?;
    let parquet_bytes = std::fs::metadata(&parquet_path)?.len();

    let chunked_path = target.with_extension("pb.zst");
    let chunked_bytes = write_chunked_container(&chunked_path, batch, zstd_level)?;

    Ok(EncodeOutcome {
        parquet_path,
        parquet_bytes,
        chunked_path,
        chunked_bytes,
    })
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let rand_suffix: u32 = rand::random();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{rand_suffix:08x}.tmp"));
    path.with_file_name(name)
}

/// Writes one Parquet file using the same `WriterVersion::PARQUET_2_0` +
/// `Compression::LZ4_RAW` settings as the corpus's lakehouse writer. On any
/// error the temp file is removed so a crash mid-encode never leaves a
/// partial file under the real name.
fn write_parquet_atomically(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let tmp = tmp_sibling(path);
    let result = (|| -> anyhow::Result<()> {
        let file = std::fs::File::create(&tmp)?;
        let props = WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(Compression::LZ4_RAW)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

const CHUNK_ROWS: usize = 8192;

/// Writes the secondary, private intermediate format: one zstd-compressed,
/// length-prefixed Arrow IPC frame per `CHUNK_ROWS`-row slice of `batch`,
/// generalized from the teacher's CBOR-then-LZ4 block framing
/// (`block_wire_format.rs` / `compression.rs`) to Arrow IPC plus the
/// configured `ZSTD_LEVEL`. Never the external contract (§6): Parquet is.
fn write_chunked_container(path: &Path, batch: &RecordBatch, zstd_level: i32) -> anyhow::Result<u64> {
    let tmp = tmp_sibling(path);
    let result = (|| -> anyhow::Result<u64> {
        let mut file = std::fs::File::create(&tmp)?;
        let mut written = 0u64;
        let mut offset = 0usize;
        while offset < batch.num_rows() {
            let len = CHUNK_ROWS.min(batch.num_rows() - offset);
            let slice = batch.slice(offset, len);
            let mut ipc_buf = Vec::new();
            {
                let mut ipc_writer = arrow::ipc::writer::StreamWriter::try_new(&mut ipc_buf, &slice.schema())?;
                ipc_writer.write(&slice)?;
                ipc_writer.finish()?;
            }
            let compressed = zstd::stream::encode_all(&ipc_buf[..], zstd_level)?;
            file.write_all(&(compressed.len() as u32).to_le_bytes())?;
            file.write_all(&compressed)?;
            written += 4 + compressed.len() as u64;
            offset += len;
        }
        Ok(written)
    })();
    match result {
        Ok(n) => {
            std::fs::rename(&tmp, path)?;
            Ok(n)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Reads back every chunk of a container written by
/// [`write_chunked_container`], decompressing and decoding each Arrow IPC
/// frame. Used by tests and by C10/C11, which need to re-read durable rows.
pub fn read_chunked_container(path: &Path) -> anyhow::Result<Vec<RecordBatch>> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut batches = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut compressed = vec![0u8; len];
        file.read_exact(&mut compressed)?;
        let decompressed = zstd::stream::decode_all(&compressed[..])?;
        let mut reader = arrow::ipc::reader::StreamReader::try_new(&decompressed[..], None)?;
        for batch in reader.by_ref() {
            batches.push(batch?);
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn sample_batch(n: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let values: Int32Array = (0..n as i32).collect();
        RecordBatch::try_new(schema, vec![Arc::new(values)]).unwrap()
    }

    #[tokio::test]
    async fn submit_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = EncoderPool::new(2, 4);
        let target = dir.path().join("updates-000-abc");
        let outcome = pool
            .submit(EncodeJob {
                target_file_path: target.clone(),
                batch: sample_batch(10),
                zstd_level: 3,
            })
            .await
            .unwrap();
        assert!(outcome.parquet_path.exists());
        assert!(outcome.chunked_path.exists());
        assert!(outcome.parquet_bytes > 0);
    }

    #[test]
    fn chunked_container_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pb.zst");
        let batch = sample_batch(20_000); // spans multiple CHUNK_ROWS frames
        write_chunked_container(&path, &batch, 3).unwrap();
        let batches = read_chunked_container(&path).unwrap();
        let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total_rows, 20_000);
    }

    #[test]
    fn empty_batch_produces_empty_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pb.zst");
        let batch = sample_batch(0);
        write_chunked_container(&path, &batch, 3).unwrap();
        let batches = read_chunked_container(&path).unwrap();
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = EncoderPool::new(1, 1);
        pool.shutdown();
        let dir = tempfile::tempdir().unwrap();
        let result = pool
            .submit(EncodeJob {
                target_file_path: dir.path().join("x"),
                batch: sample_batch(1),
                zstd_level: 1,
            })
            .await;
        assert!(result.is_err());
    }
}
