//! `LogChunk`, the unit the log pub/sub (C6) and log system (C7) move around.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of a job's two original streams a chunk's bytes came from. Streams are stored merged
/// (one file, one sequence space) but the tag is preserved per chunk (§3, and Open Question in
/// §9 about whether this must round-trip across persistence — it does, since we keep the tag on
/// the wire format of the persisted file too).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamTag {
    Stdout,
    Stderr,
    /// Not one of the job's own streams: a diagnostic line synthesized by the engine itself, or
    /// an overflow-policy marker (`alert` start/end).
    Control,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_uuid: Uuid,
    pub seq: u64,
    pub stream: StreamTag,
    pub payload: Vec<u8>,
    pub timestamp_ns: i128,
}

impl LogChunk {
    pub fn new(job_uuid: Uuid, seq: u64, stream: StreamTag, payload: Vec<u8>, timestamp_ns: i128) -> Self {
        LogChunk {
            job_uuid,
            seq,
            stream,
            payload,
            timestamp_ns,
        }
    }

    /// Builds the diagnostic chunk format specified by §7: `[joblet] <kind>: <message>`, tagged
    /// `Control` so readers can distinguish it from the job's own output.
    pub fn diagnostic(job_uuid: Uuid, seq: u64, timestamp_ns: i128, line: &str) -> Self {
        LogChunk {
            job_uuid,
            seq,
            stream: StreamTag::Control,
            payload: line.as_bytes().to_vec(),
            timestamp_ns,
        }
    }
}
