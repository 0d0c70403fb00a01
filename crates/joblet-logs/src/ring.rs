//! In-memory ring buffer with the four overflow policies from §4.7.

use crate::policy::{OverflowPolicy, SAMPLE_RATE};
use flate2::write::GzEncoder;
use flate2::Compression;
use joblet_base::log::{LogChunk, StreamTag};
use std::collections::VecDeque;
use std::io::Write;
use uuid::Uuid;

/// A contiguous run of chunks compressed into one blob under `OverflowPolicy::Compress`.
struct CompressedBatch {
    first_seq: u64,
    last_seq: u64,
    job_uuid: Uuid,
    gzipped_json_lines: Vec<u8>,
}

impl CompressedBatch {
    fn decompress(&self) -> Vec<LogChunk> {
        use std::io::Read;
        let mut decoder = flate2::read::GzDecoder::new(self.gzipped_json_lines.as_slice());
        let mut text = String::new();
        if decoder.read_to_string(&mut text).is_err() {
            return Vec::new();
        }
        text.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

pub struct RingBuffer {
    capacity: usize,
    policy: OverflowPolicy,
    live: VecDeque<LogChunk>,
    compressed: VecDeque<CompressedBatch>,
    spill_path: Option<camino::Utf8PathBuf>,
    dropped_count: u64,
    sampled_count: u64,
    incoming_count: u64,
    in_overflow: bool,
}

/// What a `push` produced, so the caller (the pipe-reader task) can decide whether to also emit
/// an `alert` control chunk into the live subscriber fan-out.
pub enum PushOutcome {
    Stored,
    Dropped,
    OverflowStarted,
    OverflowEnded,
}

impl RingBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        RingBuffer {
            capacity,
            policy,
            live: VecDeque::with_capacity(capacity.min(1024)),
            compressed: VecDeque::new(),
            spill_path: None,
            dropped_count: 0,
            sampled_count: 0,
            incoming_count: 0,
            in_overflow: false,
        }
    }

    pub fn with_spill_path(mut self, path: camino::Utf8PathBuf) -> Self {
        self.spill_path = Some(path);
        self
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    pub fn sampled_count(&self) -> u64 {
        self.sampled_count
    }

    /// Applies the active overflow policy and appends `chunk`. Never blocks: every branch is an
    /// in-memory operation or a synchronous file append, none of which wait on a subscriber.
    pub fn push(&mut self, chunk: LogChunk) -> PushOutcome {
        self.incoming_count += 1;

        if self.policy == OverflowPolicy::Sample && self.incoming_count % SAMPLE_RATE == 0 {
            self.sampled_count += 1;
            return PushOutcome::Dropped;
        }

        if self.live.len() < self.capacity {
            self.live.push_back(chunk);
            if self.in_overflow {
                self.in_overflow = false;
                return PushOutcome::OverflowEnded;
            }
            return PushOutcome::Stored;
        }

        let was_in_overflow = self.in_overflow;
        self.in_overflow = true;
        match self.policy {
            OverflowPolicy::Compress => {
                self.compress_oldest_tenth();
                self.live.push_back(chunk);
            }
            OverflowPolicy::Spill => {
                if let Some(oldest) = self.live.pop_front() {
                    self.spill(&oldest);
                }
                self.live.push_back(chunk);
            }
            OverflowPolicy::Alert => {
                // Drop the newest chunk: leave the ring untouched.
                self.dropped_count += 1;
                return if was_in_overflow {
                    PushOutcome::Dropped
                } else {
                    PushOutcome::OverflowStarted
                };
            }
            OverflowPolicy::Sample => unreachable!("handled above"),
        }
        if was_in_overflow {
            PushOutcome::Stored
        } else {
            PushOutcome::OverflowStarted
        }
    }

    fn compress_oldest_tenth(&mut self) {
        let batch_size = (self.capacity / 10).max(1);
        let mut lines = String::new();
        let mut first_seq = None;
        let mut last_seq = 0;
        let mut job_uuid = None;
        for _ in 0..batch_size {
            let Some(chunk) = self.live.pop_front() else {
                break;
            };
            job_uuid.get_or_insert(chunk.job_uuid);
            first_seq.get_or_insert(chunk.seq);
            last_seq = chunk.seq;
            if let Ok(line) = serde_json::to_string(&chunk) {
                lines.push_str(&line);
                lines.push('\n');
            }
        }
        let Some(job_uuid) = job_uuid else { return };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(lines.as_bytes()).is_err() {
            return;
        }
        let Ok(gzipped) = encoder.finish() else {
            return;
        };
        self.compressed.push_back(CompressedBatch {
            first_seq: first_seq.unwrap_or(0),
            last_seq,
            job_uuid,
            gzipped_json_lines: gzipped,
        });
    }

    fn spill(&self, chunk: &LogChunk) {
        let Some(path) = &self.spill_path else { return };
        if let Ok(line) = serde_json::to_string(chunk) {
            if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    /// Returns every chunk with `seq >= from_seq`, oldest first, reconstructing compressed
    /// batches and re-reading any spill file as needed.
    pub fn range(&self, from_seq: u64) -> Vec<LogChunk> {
        let mut out = Vec::new();
        for batch in &self.compressed {
            if batch.last_seq < from_seq {
                continue;
            }
            out.extend(
                batch
                    .decompress()
                    .into_iter()
                    .filter(|c| c.seq >= from_seq),
            );
        }
        if let Some(path) = &self.spill_path {
            if let Ok(text) = std::fs::read_to_string(path) {
                out.extend(
                    text.lines()
                        .filter_map(|line| serde_json::from_str::<LogChunk>(line).ok())
                        .filter(|c| c.seq >= from_seq),
                );
            }
        }
        out.extend(self.live.iter().filter(|c| c.seq >= from_seq).cloned());
        out.sort_by_key(|c| c.seq);
        out.dedup_by_key(|c| c.seq);
        out
    }

    pub fn alert_chunk(job_uuid: Uuid, seq: u64, timestamp_ns: i128, starting: bool) -> LogChunk {
        let message = if starting {
            "[joblet] log overflow: dropping chunks under the active policy"
        } else {
            "[joblet] log overflow ended"
        };
        LogChunk {
            job_uuid,
            seq,
            stream: StreamTag::Control,
            payload: message.as_bytes().to_vec(),
            timestamp_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(uuid: Uuid, seq: u64) -> LogChunk {
        LogChunk::new(uuid, seq, StreamTag::Stdout, vec![b'x'], 0)
    }

    #[test]
    fn alert_policy_drops_newest_and_counts() {
        let uuid = Uuid::new_v4();
        let mut ring = RingBuffer::new(2, OverflowPolicy::Alert);
        ring.push(chunk(uuid, 0));
        ring.push(chunk(uuid, 1));
        let outcome = ring.push(chunk(uuid, 2));
        assert!(matches!(outcome, PushOutcome::OverflowStarted));
        assert_eq!(ring.dropped_count(), 1);
        assert_eq!(ring.range(0).len(), 2);
    }

    #[test]
    fn sample_policy_drops_every_nth() {
        let uuid = Uuid::new_v4();
        let mut ring = RingBuffer::new(1000, OverflowPolicy::Sample);
        for i in 0..SAMPLE_RATE {
            ring.push(chunk(uuid, i));
        }
        assert_eq!(ring.sampled_count(), 1);
    }

    #[test]
    fn compress_policy_keeps_all_chunks_reachable() {
        let uuid = Uuid::new_v4();
        let mut ring = RingBuffer::new(10, OverflowPolicy::Compress);
        for i in 0..25 {
            ring.push(chunk(uuid, i));
        }
        let all = ring.range(0);
        assert_eq!(all.len(), 25);
        assert_eq!(all.first().unwrap().seq, 0);
        assert_eq!(all.last().unwrap().seq, 24);
    }

    #[test]
    fn spill_policy_persists_evicted_chunks_to_disk() {
        let uuid = Uuid::new_v4();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let mut ring = RingBuffer::new(3, OverflowPolicy::Spill).with_spill_path(path);
        for i in 0..10 {
            ring.push(chunk(uuid, i));
        }
        let all = ring.range(0);
        assert_eq!(all.len(), 10);
    }
}
