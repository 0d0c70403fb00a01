//! Scheduler (C10, §4.10): a min-heap of `(scheduledTime, UUID)` drained by a single dispatcher
//! task that wakes on the soonest entry and calls `C8.Start(UUID)`.
//!
//! Backward clock jumps aren't compensated for: entries are keyed on an absolute `DateTime<Utc>`,
//! so the dispatcher just waits out whatever the wall clock says is left. Forward jumps are
//! naturally coalesced, since a single wake drains every entry whose due time has passed rather
//! than firing once per entry.

pub mod parse;

use chrono::{DateTime, Utc};
use joblet_base::error::{JobletError, Result};
use slog::{info, warn, Logger};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tokio::sync::Notify;
use uuid::Uuid;

pub use parse::parse_schedule;

const BASE_BACKOFF: StdDuration = StdDuration::from_secs(1);
const MAX_BACKOFF: StdDuration = StdDuration::from_secs(30);
/// Chosen so a job stuck behind a full daemon gets roughly ten minutes of retries (1+2+4+...+30
/// capped, repeated) before the scheduler gives up on it.
const MAX_CAPACITY_RETRIES: u32 = 8;

/// The scheduler's view of C8: start a due job, or give up on one that never got a slot.
#[async_trait::async_trait]
pub trait JobStarter: Send + Sync {
    async fn start(&self, job_uuid: Uuid) -> Result<()>;
    async fn fail(&self, job_uuid: Uuid, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    due: DateTime<Utc>,
    job_uuid: Uuid,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.job_uuid.cmp(&other.job_uuid))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Scheduler {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    attempts: Mutex<HashMap<Uuid, u32>>,
    notify: Notify,
    starter: Arc<dyn JobStarter>,
    logger: Logger,
}

impl Scheduler {
    pub fn new(starter: Arc<dyn JobStarter>, logger: Logger) -> Arc<Self> {
        Arc::new(Scheduler {
            heap: Mutex::new(BinaryHeap::new()),
            attempts: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            starter,
            logger,
        })
    }

    /// Queues `job_uuid` to start at `due`, waking the dispatcher if this is now the soonest entry.
    pub fn schedule(&self, job_uuid: Uuid, due: DateTime<Utc>) {
        self.heap.lock().unwrap().push(Reverse(HeapEntry { due, job_uuid }));
        self.notify.notify_one();
    }

    /// Spawns the dispatcher loop. One per daemon process.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    async fn run(&self) {
        loop {
            let due_now = self.drain_due(Utc::now());
            for job_uuid in due_now {
                self.dispatch(job_uuid).await;
            }
            let next_due = self.heap.lock().unwrap().peek().map(|Reverse(e)| e.due);
            match next_due {
                None => self.notify.notified().await,
                Some(due) => {
                    let wait = (due - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    fn drain_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut heap = self.heap.lock().unwrap();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.due > now {
                break;
            }
            due.push(heap.pop().unwrap().0.job_uuid);
        }
        due
    }

    async fn dispatch(&self, job_uuid: Uuid) {
        match self.starter.start(job_uuid).await {
            Ok(()) => {
                self.attempts.lock().unwrap().remove(&job_uuid);
            }
            Err(JobletError::Capacity) => self.retry_after_capacity(job_uuid),
            Err(err) => {
                self.attempts.lock().unwrap().remove(&job_uuid);
                warn!(self.logger, "scheduled start failed"; "job" => %job_uuid, "error" => %err);
            }
        }
    }

    fn retry_after_capacity(&self, job_uuid: Uuid) {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(job_uuid).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt > MAX_CAPACITY_RETRIES {
            self.attempts.lock().unwrap().remove(&job_uuid);
            warn!(self.logger, "giving up after repeated capacity errors"; "job" => %job_uuid, "attempts" => attempt - 1);
            let starter = Arc::clone(&self.starter);
            tokio::spawn(async move {
                starter
                    .fail(job_uuid, "max concurrent jobs still exceeded after repeated retries")
                    .await;
            });
            return;
        }
        let backoff = std::cmp::min(BASE_BACKOFF.saturating_mul(1u32 << (attempt - 1)), MAX_BACKOFF);
        let due = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
        info!(self.logger, "retrying after capacity error"; "job" => %job_uuid, "attempt" => attempt, "backoff_secs" => backoff.as_secs());
        self.schedule(job_uuid, due);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeStarter {
        responses: AsyncMutex<Vec<Result<()>>>,
        start_calls: AtomicUsize,
        failed: AsyncMutex<Vec<(Uuid, String)>>,
    }

    impl FakeStarter {
        fn new(responses: Vec<Result<()>>) -> Self {
            FakeStarter {
                responses: AsyncMutex::new(responses),
                start_calls: AtomicUsize::new(0),
                failed: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl JobStarter for FakeStarter {
        async fn start(&self, _job_uuid: Uuid) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses
                    .last()
                    .map(|r| match r {
                        Ok(()) => Ok(()),
                        Err(_) => Err(JobletError::Capacity),
                    })
                    .unwrap_or(Ok(()))
            }
        }

        async fn fail(&self, job_uuid: Uuid, reason: &str) {
            self.failed.lock().await.push((job_uuid, reason.to_string()));
        }
    }

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn drain_due_only_returns_entries_at_or_before_now() {
        let starter = Arc::new(FakeStarter::new(vec![Ok(())]));
        let scheduler = Scheduler::new(starter, logger());
        let now = Utc::now();
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        scheduler.schedule(early, now - ChronoDuration::seconds(5));
        scheduler.schedule(late, now + ChronoDuration::hours(1));

        let due = scheduler.drain_due(now);
        assert_eq!(due, vec![early]);
        assert_eq!(scheduler.heap.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_success_clears_attempt_counter() {
        let starter = Arc::new(FakeStarter::new(vec![Ok(())]));
        let scheduler = Scheduler::new(starter, logger());
        let job_uuid = Uuid::new_v4();
        scheduler.retry_after_capacity(job_uuid);
        assert_eq!(*scheduler.attempts.lock().unwrap().get(&job_uuid).unwrap(), 1);

        scheduler.dispatch(job_uuid).await;
        assert!(scheduler.attempts.lock().unwrap().get(&job_uuid).is_none());
    }

    #[tokio::test]
    async fn repeated_capacity_errors_eventually_give_up() {
        let starter = Arc::new(FakeStarter::new(vec![Err(JobletError::Capacity)]));
        let scheduler = Scheduler::new(Arc::clone(&starter) as Arc<dyn JobStarter>, logger());
        let job_uuid = Uuid::new_v4();

        for _ in 0..=MAX_CAPACITY_RETRIES {
            scheduler.dispatch(job_uuid).await;
        }
        // The final retry spawns `fail` on its own task; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        assert!(scheduler.attempts.lock().unwrap().get(&job_uuid).is_none());
        let failed = starter.failed.lock().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, job_uuid);
    }
}
