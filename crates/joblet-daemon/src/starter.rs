//! The scheduler's view of `C8` (§4.10): turns a due `Scheduled` job into a running one, or closes
//! it out as `Failed` if `Engine::start_job` rejects it for a reason the scheduler shouldn't keep
//! retrying.

use chrono::Utc;
use joblet_base::error::{JobletError, Result};
use joblet_base::job::{JobStatus, Outcome};
use joblet_exec::Engine;
use joblet_logs::LogRegistry;
use joblet_scheduler::JobStarter;
use joblet_store::JobStore;
use slog::{info, Logger};
use std::sync::Arc;
use uuid::Uuid;

pub struct EngineJobStarter {
    engine: Arc<Engine>,
    store: Arc<JobStore>,
    logs: Arc<LogRegistry>,
    logger: Logger,
}

impl EngineJobStarter {
    pub fn new(engine: Arc<Engine>, store: Arc<JobStore>, logs: Arc<LogRegistry>, logger: Logger) -> Arc<Self> {
        Arc::new(EngineJobStarter {
            engine,
            store,
            logs,
            logger,
        })
    }

    async fn fail_with_reason(&self, job_uuid: Uuid, reason: &str) {
        let _ = self
            .store
            .transition(job_uuid, JobStatus::Failed, Utc::now(), Outcome::default());
        if let Ok(writer) = self.logs.create_writer(job_uuid).await {
            let chunk = writer.diagnostic(now_ns(), &format!("[joblet] scheduler: {reason}"));
            let _ = self.store.publish(job_uuid, chunk).await;
        }
        self.logs.remove(job_uuid);
        info!(self.logger, "scheduled job failed"; "job" => %job_uuid, "reason" => reason);
    }
}

#[async_trait::async_trait]
impl JobStarter for EngineJobStarter {
    /// Moves the job `Scheduled -> Initializing` on its first dispatch attempt only: a
    /// `Capacity` error reschedules this same job without touching its status again, so a second
    /// attempt must not try the `Scheduled -> Initializing` edge a second time.
    async fn start(&self, job_uuid: Uuid) -> Result<()> {
        let job = self
            .store
            .get(job_uuid)
            .ok_or_else(|| JobletError::not_found(job_uuid))?;
        if job.status == JobStatus::Scheduled {
            self.store
                .transition(job_uuid, JobStatus::Initializing, Utc::now(), Outcome::default())?;
        }

        match self.engine.start_job(job_uuid, job.spec).await {
            Ok(()) => Ok(()),
            Err(JobletError::Capacity) => Err(JobletError::Capacity),
            Err(err) => {
                self.fail_with_reason(job_uuid, &err.to_string()).await;
                Ok(())
            }
        }
    }

    async fn fail(&self, job_uuid: Uuid, reason: &str) {
        self.fail_with_reason(job_uuid, reason).await;
    }
}

fn now_ns() -> i128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i128
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use joblet_base::job::JobSpec;
    use joblet_base::limits::{HostInfo, Limits};
    use joblet_cgroup::CgroupManager;
    use joblet_exec::EngineConfig;
    use joblet_linux::FakePlatform;
    use joblet_network::{veth::FakeVethControl, NetworkManager};
    use slog::o;
    use std::time::Duration;

    fn components(max_concurrent_jobs: usize) -> (Arc<EngineJobStarter>, Arc<JobStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let logger = Logger::root(slog::Discard, o!());
        let platform: Arc<dyn joblet_linux::Platform> = Arc::new(FakePlatform::new());
        let cgroup = CgroupManager::new(root.join("cgroup"), Arc::clone(&platform), logger.clone());
        let fs = joblet_fs::FsIsolator::new(root.join("state"), Arc::clone(&platform), logger.clone());
        let network = Arc::new(NetworkManager::new(Box::new(FakeVethControl::new()), logger.clone()));
        let logs = Arc::new(LogRegistry::new(
            root.join("logs"),
            joblet_logs::policy::OverflowPolicy::Alert,
            100,
            logger.clone(),
        ));
        let store = Arc::new(JobStore::new(logger.clone()).with_history_source(Arc::clone(&logs) as _));
        let host = HostInfo {
            cpu_cores: 4,
            memory_bytes: 16 * 1024 * 1024 * 1024,
            gpu_count: 0,
            gpu_memory_mb: 0,
        };
        let engine = Engine::new(
            cgroup,
            fs,
            network,
            Arc::clone(&logs),
            Arc::clone(&store),
            platform,
            host,
            EngineConfig {
                max_concurrent_jobs,
                cleanup_timeout: Duration::from_secs(5),
                job_timeout: Duration::from_secs(3600),
                reexec_path: "/proc/self/exe".to_string(),
            },
            logger.clone(),
        );
        let starter = EngineJobStarter::new(engine, Arc::clone(&store), logs, logger);
        (starter, store, tmp)
    }

    fn spec() -> JobSpec {
        JobSpec {
            command: "/bin/true".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_dispatch_moves_scheduled_to_initializing_then_reports_capacity() {
        let (starter, store, _tmp) = components(0);
        let job_uuid = Uuid::new_v4();
        store
            .create(
                job_uuid,
                JobSpec {
                    scheduled_time: Some(Utc::now()),
                    ..spec()
                },
            )
            .unwrap();

        let err = starter.start(job_uuid).await.unwrap_err();
        assert!(matches!(err, JobletError::Capacity));
        assert_eq!(store.get(job_uuid).unwrap().status, JobStatus::Initializing);
    }

    /// A capacity-driven retry must not attempt the `Scheduled -> Initializing` edge a second
    /// time; `start` skips the transition once the job is already `Initializing`.
    #[tokio::test]
    async fn retry_after_capacity_does_not_repeat_the_initializing_transition() {
        let (starter, store, _tmp) = components(0);
        let job_uuid = Uuid::new_v4();
        store
            .create(
                job_uuid,
                JobSpec {
                    scheduled_time: Some(Utc::now()),
                    ..spec()
                },
            )
            .unwrap();

        assert!(matches!(starter.start(job_uuid).await, Err(JobletError::Capacity)));
        assert!(matches!(starter.start(job_uuid).await, Err(JobletError::Capacity)));
        assert_eq!(store.get(job_uuid).unwrap().status, JobStatus::Initializing);
    }

    #[tokio::test]
    async fn non_capacity_failure_is_closed_out_as_failed() {
        let (starter, store, _tmp) = components(10);
        let job_uuid = Uuid::new_v4();
        store
            .create(
                job_uuid,
                JobSpec {
                    scheduled_time: Some(Utc::now()),
                    limits: Limits {
                        max_memory_mb: u64::MAX,
                        ..Default::default()
                    },
                    ..spec()
                },
            )
            .unwrap();

        assert!(starter.start(job_uuid).await.is_ok());
        assert_eq!(store.get(job_uuid).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn fail_transitions_job_directly() {
        let (starter, store, _tmp) = components(10);
        let job_uuid = Uuid::new_v4();
        store.create(job_uuid, spec()).unwrap();

        starter.fail(job_uuid, "gave up retrying").await;
        assert_eq!(store.get(job_uuid).unwrap().status, JobStatus::Failed);
    }
}
