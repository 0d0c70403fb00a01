//! The job registry and log pub/sub (C6, §4.6): a single process-wide map guarded by one
//! `RwLock`, with per-job mutation serialized through a per-job mutex to preserve FSM
//! monotonicity.

use chrono::{DateTime, Utc};
use joblet_base::error::{JobletError, Result};
use joblet_base::job::{Job, JobSpec, JobStatus, Outcome};
use joblet_base::log::LogChunk;
use slog::{info, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Supplies persisted history to a late `Subscribe` against an already-terminal job. Implemented
/// by `joblet-logs`; optional here so the store has no hard dependency on the log crate.
pub trait HistorySource: Send + Sync {
    fn history(&self, job_uuid: Uuid) -> Vec<LogChunk>;
}

pub const DEFAULT_SUBSCRIBER_DEADLINE: Duration = Duration::from_millis(100);
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub workflow_id: Option<Uuid>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(workflow_id) = self.workflow_id {
            if job.spec.workflow_id != Some(workflow_id) {
                return false;
            }
        }
        true
    }
}

struct SubscriberEntry {
    id: Uuid,
    sender: mpsc::Sender<LogChunk>,
}

struct JobEntry {
    job: Mutex<Job>,
    subscribers: Mutex<Vec<SubscriberEntry>>,
}

pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Arc<JobEntry>>>,
    subscriber_deadline: Duration,
    history: Option<Arc<dyn HistorySource>>,
    logger: Logger,
}

impl JobStore {
    pub fn new(logger: Logger) -> Self {
        JobStore {
            jobs: RwLock::new(HashMap::new()),
            subscriber_deadline: DEFAULT_SUBSCRIBER_DEADLINE,
            history: None,
            logger,
        }
    }

    pub fn with_subscriber_deadline(mut self, deadline: Duration) -> Self {
        self.subscriber_deadline = deadline;
        self
    }

    pub fn with_history_source(mut self, history: Arc<dyn HistorySource>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn put(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.uuid) {
            return Err(JobletError::validation(format!(
                "job {} already exists",
                job.uuid
            )));
        }
        jobs.insert(
            job.uuid,
            Arc::new(JobEntry {
                job: Mutex::new(job),
                subscribers: Mutex::new(Vec::new()),
            }),
        );
        Ok(())
    }

    pub fn create(&self, uuid: Uuid, spec: JobSpec) -> Result<()> {
        self.put(Job::new(uuid, spec))
    }

    pub fn get(&self, uuid: Uuid) -> Option<Job> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(&uuid).map(|entry| entry.job.lock().unwrap().clone())
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.read().unwrap();
        jobs.values()
            .map(|entry| entry.job.lock().unwrap().clone())
            .filter(|job| filter.matches(job))
            .collect()
    }

    /// Validates and applies the FSM transition; on entering a terminal state, closes and drops
    /// every subscriber so they observe channel closure right after the last chunk they were
    /// sent (§4.6's "receives no chunk after close").
    pub fn transition(
        &self,
        uuid: Uuid,
        next: JobStatus,
        now: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<()> {
        let entry = self.entry(uuid)?;
        {
            let mut job = entry.job.lock().unwrap();
            job.transition(next, now, outcome)?;
        }
        if next.is_terminal() {
            entry.subscribers.lock().unwrap().clear();
            info!(self.logger, "job reached terminal state, subscribers closed"; "job" => %uuid, "status" => %next);
        }
        Ok(())
    }

    /// Registers a new subscriber. If the job is already terminal, synthesizes the persisted
    /// history (if a `HistorySource` is configured) and returns a receiver that closes
    /// immediately after, rather than staying open.
    pub fn subscribe(&self, uuid: Uuid) -> Result<(Uuid, mpsc::Receiver<LogChunk>)> {
        let entry = self.entry(uuid)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let is_terminal = entry.job.lock().unwrap().status.is_terminal();
        let subscriber_id = Uuid::new_v4();

        if is_terminal {
            if let Some(history) = &self.history {
                for chunk in history.history(uuid) {
                    // Best effort: a full channel this early would mean a pathological history
                    // replay size; drop silently rather than block `Subscribe` itself.
                    let _ = tx.try_send(chunk);
                }
            }
            return Ok((subscriber_id, rx));
        }

        entry.subscribers.lock().unwrap().push(SubscriberEntry {
            id: subscriber_id,
            sender: tx,
        });
        Ok((subscriber_id, rx))
    }

    pub fn unsubscribe(&self, uuid: Uuid, subscriber_id: Uuid) {
        if let Ok(entry) = self.entry(uuid) {
            entry
                .subscribers
                .lock()
                .unwrap()
                .retain(|s| s.id != subscriber_id);
        }
    }

    /// Fans `chunk` out to every live subscriber, evicting (without blocking the caller) anyone
    /// who doesn't drain within the configured deadline (§4.6's "`Publish` never blocks on slow
    /// subscribers").
    pub async fn publish(&self, uuid: Uuid, chunk: LogChunk) -> Result<()> {
        let entry = self.entry(uuid)?;
        let deadline = self.subscriber_deadline;
        let snapshot: Vec<SubscriberSend> = {
            let subs = entry.subscribers.lock().unwrap();
            subs.iter()
                .map(|s| SubscriberSend {
                    id: s.id,
                    sender: s.sender.clone(),
                })
                .collect()
        };

        let mut evicted = Vec::new();
        for sub in snapshot {
            match tokio::time::timeout(deadline, sub.sender.send(chunk.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => evicted.push(sub.id),
            }
        }
        if !evicted.is_empty() {
            let mut subs = entry.subscribers.lock().unwrap();
            subs.retain(|s| !evicted.contains(&s.id));
        }
        Ok(())
    }

    fn entry(&self, uuid: Uuid) -> Result<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| JobletError::not_found(uuid))
    }
}

struct SubscriberSend {
    id: Uuid,
    sender: mpsc::Sender<LogChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_base::log::StreamTag;
    use slog::o;

    fn store() -> JobStore {
        JobStore::new(Logger::root(slog::Discard, o!()))
    }

    fn spec() -> JobSpec {
        JobSpec {
            command: "/bin/echo".into(),
            ..Default::default()
        }
    }

    #[test]
    fn put_rejects_duplicate_uuid() {
        let store = store();
        let uuid = Uuid::new_v4();
        store.create(uuid, spec()).unwrap();
        let err = store.create(uuid, spec()).unwrap_err();
        assert!(matches!(err, JobletError::Validation(_)));
    }

    #[test]
    fn list_filters_by_status() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create(a, spec()).unwrap();
        store.create(b, spec()).unwrap();
        store
            .transition(a, JobStatus::Running, Utc::now(), Outcome::default())
            .unwrap();

        let running = store.list(&JobFilter {
            status: Some(JobStatus::Running),
            workflow_id: None,
        });
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].uuid, a);
    }

    #[tokio::test]
    async fn subscriber_receives_chunks_until_terminal_then_closes() {
        let store = store();
        let uuid = Uuid::new_v4();
        store.create(uuid, spec()).unwrap();
        store
            .transition(uuid, JobStatus::Running, Utc::now(), Outcome::default())
            .unwrap();

        let (_id, mut rx) = store.subscribe(uuid).unwrap();
        let chunk = LogChunk::new(uuid, 0, StreamTag::Stdout, b"hi".to_vec(), 0);
        store.publish(uuid, chunk).await.unwrap();
        assert!(rx.recv().await.is_some());

        store
            .transition(uuid, JobStatus::Completed, Utc::now(), Outcome::default())
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_on_terminal_job_replays_history_then_closes() {
        struct FixedHistory;
        impl HistorySource for FixedHistory {
            fn history(&self, job_uuid: Uuid) -> Vec<LogChunk> {
                vec![LogChunk::new(job_uuid, 0, StreamTag::Stdout, b"past".to_vec(), 0)]
            }
        }

        let store = store().with_history_source(Arc::new(FixedHistory));
        let uuid = Uuid::new_v4();
        store.create(uuid, spec()).unwrap();
        store
            .transition(uuid, JobStatus::Running, Utc::now(), Outcome::default())
            .unwrap();
        store
            .transition(uuid, JobStatus::Completed, Utc::now(), Outcome::default())
            .unwrap();

        let (_id, mut rx) = store.subscribe(uuid).unwrap();
        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.payload, b"past");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_uuid_is_not_found() {
        let store = store();
        let err = store.subscribe(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, JobletError::NotFound(_)));
    }
}
