//! Async gzip persistence to `/opt/joblet/logs/<uuid>/stdout.log.gz` (§4.7). Batches writes by
//! time (≤ 50 ms) or size (≥ 64 KiB), whichever comes first, so a slow disk never holds up the
//! producer.

use async_compression::tokio::write::GzipEncoder;
use camino::Utf8PathBuf;
use joblet_base::log::LogChunk;
use slog::{warn, Logger};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const BATCH_TIME: Duration = Duration::from_millis(50);
const BATCH_SIZE_BYTES: usize = 64 * 1024;

pub struct PersistHandle {
    sender: mpsc::UnboundedSender<LogChunk>,
}

impl PersistHandle {
    /// Non-blocking: the send only fails if the writer task has already exited (e.g. disk
    /// unrecoverably gone), which the caller treats like any other transient log error.
    pub fn append(&self, chunk: LogChunk) {
        let _ = self.sender.send(chunk);
    }
}

/// Spawns the batching writer task and returns a handle to feed it. The file is created (and its
/// parent directory, if missing) before the task starts accepting chunks.
pub async fn spawn_writer(path: Utf8PathBuf, logger: Logger) -> std::io::Result<PersistHandle> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = File::create(path.as_std_path()).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(file, rx, logger));
    Ok(PersistHandle { sender: tx })
}

async fn run_writer(file: File, mut rx: mpsc::UnboundedReceiver<LogChunk>, logger: Logger) {
    let mut encoder = GzipEncoder::new(file);
    let mut pending_bytes = 0usize;

    loop {
        let timer = tokio::time::sleep(BATCH_TIME);
        tokio::pin!(timer);

        tokio::select! {
            maybe_chunk = rx.recv() => {
                match maybe_chunk {
                    Some(chunk) => {
                        if let Ok(line) = serde_json::to_string(&chunk) {
                            pending_bytes += line.len() + 1;
                            if encoder.write_all(line.as_bytes()).await.is_err()
                                || encoder.write_all(b"\n").await.is_err()
                            {
                                warn!(logger, "log persistence write failed"; "job" => %chunk.job_uuid);
                                break;
                            }
                        }
                        if pending_bytes >= BATCH_SIZE_BYTES {
                            let _ = encoder.flush().await;
                            pending_bytes = 0;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut timer => {
                if pending_bytes > 0 {
                    let _ = encoder.flush().await;
                    pending_bytes = 0;
                }
            }
        }
    }

    // `shutdown` finishes the gzip member cleanly so a clean exit always leaves valid gzip on
    // disk, per §4.7's persistence contract.
    let _ = encoder.shutdown().await;
}
