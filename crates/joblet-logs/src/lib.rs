//! The async log system (C7, §4.7): one ring buffer and one gzip persistence task per job.

pub mod persist;
pub mod policy;
pub mod ring;

use camino::Utf8PathBuf;
use joblet_base::error::{JobletError, Result};
use joblet_base::log::{LogChunk, StreamTag};
use joblet_store::HistorySource;
use policy::OverflowPolicy;
use ring::RingBuffer;
use slog::Logger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// One job's live ring buffer plus its persistence task handle.
pub struct LogWriter {
    job_uuid: Uuid,
    ring: Mutex<RingBuffer>,
    persist: persist::PersistHandle,
    next_seq: AtomicU64,
}

impl LogWriter {
    /// Appends a chunk, assigning the next sequence number, pushing it through the overflow
    /// policy, and handing it to the persistence task. Never blocks on disk.
    pub fn append(&self, stream: StreamTag, payload: Vec<u8>, timestamp_ns: i128) -> LogChunk {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let chunk = LogChunk::new(self.job_uuid, seq, stream, payload, timestamp_ns);
        let outcome = self.ring.lock().unwrap().push(chunk.clone());
        self.persist.append(chunk.clone());

        use ring::PushOutcome::*;
        match outcome {
            OverflowStarted => {
                let alert_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let alert = RingBuffer::alert_chunk(self.job_uuid, alert_seq, timestamp_ns, true);
                self.ring.lock().unwrap().push(alert);
            }
            OverflowEnded => {
                let alert_seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let alert = RingBuffer::alert_chunk(self.job_uuid, alert_seq, timestamp_ns, false);
                self.ring.lock().unwrap().push(alert);
            }
            Stored | Dropped => {}
        }
        chunk
    }

    pub fn diagnostic(&self, timestamp_ns: i128, line: &str) -> LogChunk {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let chunk = LogChunk::diagnostic(self.job_uuid, seq, timestamp_ns, line);
        self.ring.lock().unwrap().push(chunk.clone());
        self.persist.append(chunk.clone());
        chunk
    }

    /// The ring's current view from `from_seq` on; does not include anything already evicted to
    /// the persisted file unless the active policy keeps it reachable (compress/spill do; alert
    /// and sample do not, by design).
    pub fn live_range(&self, from_seq: u64) -> Vec<LogChunk> {
        self.ring.lock().unwrap().range(from_seq)
    }

    pub fn dropped_count(&self) -> u64 {
        self.ring.lock().unwrap().dropped_count()
    }
}

/// Owns every active job's `LogWriter` and the shared persistence-path convention
/// (`<logs_root>/<uuid>/stdout.log.gz`).
pub struct LogRegistry {
    writers: RwLock<HashMap<Uuid, Arc<LogWriter>>>,
    logs_root: Utf8PathBuf,
    default_policy: OverflowPolicy,
    default_capacity: usize,
    logger: Logger,
}

impl LogRegistry {
    pub fn new(
        logs_root: Utf8PathBuf,
        default_policy: OverflowPolicy,
        default_capacity: usize,
        logger: Logger,
    ) -> Self {
        LogRegistry {
            writers: RwLock::new(HashMap::new()),
            logs_root,
            default_policy,
            default_capacity,
            logger,
        }
    }

    pub fn persisted_path(&self, job_uuid: Uuid) -> Utf8PathBuf {
        self.logs_root.join(job_uuid.to_string()).join("stdout.log.gz")
    }

    /// Creates and registers a writer for a newly-running job. Idempotent re-registration is not
    /// supported: call once per job lifetime, mirroring one log writer per job from §4.7.
    pub async fn create_writer(&self, job_uuid: Uuid) -> Result<Arc<LogWriter>> {
        let path = self.persisted_path(job_uuid);
        let persist = persist::spawn_writer(path, self.logger.clone())
            .await
            .map_err(JobletError::from)?;
        let writer = Arc::new(LogWriter {
            job_uuid,
            ring: Mutex::new(RingBuffer::new(self.default_capacity, self.default_policy)),
            persist,
            next_seq: AtomicU64::new(0),
        });
        self.writers.write().unwrap().insert(job_uuid, writer.clone());
        Ok(writer)
    }

    pub fn writer(&self, job_uuid: Uuid) -> Option<Arc<LogWriter>> {
        self.writers.read().unwrap().get(&job_uuid).cloned()
    }

    /// Drops the in-memory writer. The persisted gzip file on disk is left for `read_persisted`
    /// and isn't deleted here; job teardown deletes the whole job tree separately if desired.
    pub fn remove(&self, job_uuid: Uuid) {
        self.writers.write().unwrap().remove(&job_uuid);
    }

    /// Reads and decompresses the persisted file for a job, tolerating a truncated final gzip
    /// member from a prior crash (§4.7's persistence contract).
    pub async fn read_persisted(&self, job_uuid: Uuid) -> Vec<LogChunk> {
        let path = self.persisted_path(job_uuid).into_std_path_buf();
        tokio::task::spawn_blocking(move || read_persisted_blocking(&path))
            .await
            .unwrap_or_default()
    }

    /// `Range(uuid, fromSeq)` per §4.7: persisted history first, then whatever the ring still
    /// holds, de-duplicated by sequence number. A caller wanting the "switches to live" half of
    /// the contract layers a `JobStore::subscribe` on top of this for an in-progress job.
    pub async fn range(&self, job_uuid: Uuid, from_seq: u64) -> Vec<LogChunk> {
        let mut out = self.read_persisted(job_uuid).await;
        if let Some(writer) = self.writer(job_uuid) {
            out.extend(writer.live_range(from_seq));
        }
        out.retain(|c| c.seq >= from_seq);
        out.sort_by_key(|c| c.seq);
        out.dedup_by_key(|c| c.seq);
        out
    }
}

fn read_persisted_blocking(path: &std::path::Path) -> Vec<LogChunk> {
    use std::io::Read;
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let mut decoder = flate2::read::MultiGzDecoder::new(file);
    let mut text = String::new();
    // A crash mid-write can truncate the final gzip member; `read_to_string` returning an error
    // after partial data is still usable, so fall through instead of discarding it.
    let _ = decoder.read_to_string(&mut text);
    text.lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

impl HistorySource for LogRegistry {
    fn history(&self, job_uuid: Uuid) -> Vec<LogChunk> {
        let path = self.persisted_path(job_uuid).into_std_path_buf();
        read_persisted_blocking(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_persisted_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let logger = Logger::root(slog::Discard, slog::o!());
        let registry = LogRegistry::new(logs_root, OverflowPolicy::Alert, 100, logger);

        let job_uuid = Uuid::new_v4();
        let writer = registry.create_writer(job_uuid).await.unwrap();
        writer.append(StreamTag::Stdout, b"hello".to_vec(), 1);
        writer.append(StreamTag::Stderr, b"world".to_vec(), 2);

        // Drop the writer to force the persistence task to flush and shut down cleanly.
        registry.remove(job_uuid);
        drop(writer);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let persisted = registry.read_persisted(job_uuid).await;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].payload, b"hello");
    }

    #[tokio::test]
    async fn live_range_reflects_ring_state() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let logger = Logger::root(slog::Discard, slog::o!());
        let registry = LogRegistry::new(logs_root, OverflowPolicy::Alert, 10, logger);
        let job_uuid = Uuid::new_v4();
        let writer = registry.create_writer(job_uuid).await.unwrap();

        writer.append(StreamTag::Stdout, b"a".to_vec(), 0);
        writer.append(StreamTag::Stdout, b"b".to_vec(), 0);
        assert_eq!(writer.live_range(0).len(), 2);
    }
}
