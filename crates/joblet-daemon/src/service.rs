//! The RPC surface described in §6: "names are semantic, not wire." This trait is the seam a
//! transport (gRPC or otherwise) would sit behind; it is intentionally not wired to any wire
//! format here, since the wire protocol itself is out of scope for the core.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use joblet_base::error::{JobletError, Result};
use joblet_base::job::{JobSpec, JobStatus, Outcome};
use joblet_base::log::LogChunk;
use joblet_base::workflow::Workflow;
use joblet_exec::Engine;
use joblet_fs::FsIsolator;
use joblet_logs::LogRegistry;
use joblet_network::NetworkManager;
use joblet_scheduler::Scheduler;
use joblet_store::{JobFilter, JobStore};
use joblet_workflow::WorkflowEngine;
use slog::{info, warn, Logger};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// The subset of a [`Job`](joblet_base::job::Job) returned by `RunJob`/`StopJob`/`ListJobs`: just
/// enough to identify the job and its current status.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub uuid: Uuid,
    pub status: JobStatus,
}

/// The full job view returned by `GetJobStatus`, with `secretEnv` redacted per §3.
#[derive(Debug, Clone)]
pub struct JobDetail {
    pub uuid: Uuid,
    pub status: JobStatus,
    pub command: String,
    pub args: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub env: BTreeMap<String, String>,
}

impl From<&joblet_base::job::Job> for JobSummary {
    fn from(job: &joblet_base::job::Job) -> Self {
        JobSummary {
            uuid: job.uuid,
            status: job.status,
        }
    }
}

impl From<joblet_base::job::Job> for JobDetail {
    fn from(job: joblet_base::job::Job) -> Self {
        JobDetail {
            uuid: job.uuid,
            status: job.status,
            command: job.spec.command.clone(),
            args: job.spec.args.clone(),
            start_time: job.start_time,
            end_time: job.end_time,
            outcome: job.outcome.clone(),
            env: job.redacted_env(),
        }
    }
}

#[async_trait::async_trait]
pub trait JobletService: Send + Sync {
    async fn run_job(&self, spec: JobSpec) -> Result<JobSummary>;
    async fn get_job_status(&self, job_uuid: Uuid) -> Result<JobDetail>;
    async fn stop_job(&self, job_uuid: Uuid) -> Result<JobSummary>;
    async fn list_jobs(&self, filter: JobFilter) -> Vec<JobSummary>;
    async fn get_job_logs(
        &self,
        job_uuid: Uuid,
    ) -> Result<Pin<Box<dyn Stream<Item = LogChunk> + Send>>>;
    async fn run_workflow(&self, yaml_bytes: Vec<u8>) -> Result<Workflow>;
    async fn get_workflow_status(&self, workflow_uuid: Uuid) -> Result<Workflow>;
    async fn list_workflows(&self) -> Vec<Workflow>;
}

/// The RPC front door's implementation: every handler is a thin adapter onto the already-built
/// components (`Engine`, `JobStore`, `LogRegistry`, `Scheduler`, `WorkflowEngine`).
pub struct Daemon {
    pub(crate) engine: Arc<Engine>,
    pub(crate) store: Arc<JobStore>,
    pub(crate) logs: Arc<LogRegistry>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) workflows: Arc<WorkflowEngine>,
    pub(crate) fs: Arc<FsIsolator>,
    pub(crate) network: Arc<NetworkManager>,
    pub(crate) logger: Logger,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<JobStore>,
        logs: Arc<LogRegistry>,
        scheduler: Arc<Scheduler>,
        workflows: Arc<WorkflowEngine>,
        fs: Arc<FsIsolator>,
        network: Arc<NetworkManager>,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Daemon {
            engine,
            store,
            logs,
            scheduler,
            workflows,
            fs,
            network,
            logger,
        })
    }

    /// Spawns Stage A in the background and guarantees the job never gets stuck in
    /// `Initializing`: `Engine::start_job`'s own early-return paths (a resource failure or a
    /// `Capacity` error) don't transition the job themselves, so this closes it out directly —
    /// the same fallback `WorkflowEngine::admit` uses for workflow jobs. Clones the individual
    /// `Arc` fields it needs rather than requiring an `Arc<Daemon>` receiver, so `run_job` can
    /// stay a plain `&self` trait method.
    fn spawn_immediate_start(&self, job_uuid: Uuid, spec: JobSpec) {
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let logs = Arc::clone(&self.logs);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.start_job(job_uuid, spec).await {
                warn!(logger, "job failed to start"; "job" => %job_uuid, "error" => %err);
                let _ = store.transition(job_uuid, JobStatus::Failed, Utc::now(), Outcome::default());
                if let Ok(writer) = logs.create_writer(job_uuid).await {
                    let chunk = writer.diagnostic(now_ns(), &format!("[joblet] {err}"));
                    let _ = store.publish(job_uuid, chunk).await;
                }
                logs.remove(job_uuid);
            }
        });
    }
}

#[async_trait::async_trait]
impl JobletService for Daemon {
    /// Validates and creates the job, then either hands it to the scheduler (if `scheduledTime`
    /// is set) or starts it immediately in the background; returns the UUID right away either
    /// way, per §6.
    async fn run_job(&self, spec: JobSpec) -> Result<JobSummary> {
        spec.limits.validate(&self.engine.host_info())?;
        let job_uuid = Uuid::new_v4();
        self.store.create(job_uuid, spec.clone())?;
        let job = self.store.get(job_uuid).expect("just created");

        if let Some(due) = spec.scheduled_time {
            self.scheduler.schedule(job_uuid, due);
        } else {
            self.spawn_immediate_start(job_uuid, spec);
        }
        info!(self.logger, "job accepted"; "job" => %job_uuid);
        Ok(JobSummary::from(&job))
    }

    async fn get_job_status(&self, job_uuid: Uuid) -> Result<JobDetail> {
        self.store
            .get(job_uuid)
            .map(JobDetail::from)
            .ok_or_else(|| JobletError::not_found(job_uuid))
    }

    async fn stop_job(&self, job_uuid: Uuid) -> Result<JobSummary> {
        self.engine.stop(job_uuid).await?;
        let job = self
            .store
            .get(job_uuid)
            .ok_or_else(|| JobletError::not_found(job_uuid))?;
        Ok(JobSummary::from(&job))
    }

    async fn list_jobs(&self, filter: JobFilter) -> Vec<JobSummary> {
        self.store.list(&filter).iter().map(JobSummary::from).collect()
    }

    /// Sends persisted-plus-ring history first, then whatever the job publishes after that point,
    /// de-duplicated by sequence number (§6's "sends history then live chunks until job
    /// terminates or client disconnects").
    async fn get_job_logs(
        &self,
        job_uuid: Uuid,
    ) -> Result<Pin<Box<dyn Stream<Item = LogChunk> + Send>>> {
        let job = self
            .store
            .get(job_uuid)
            .ok_or_else(|| JobletError::not_found(job_uuid))?;
        let history = self.logs.range(job_uuid, 0).await;
        if job.status.is_terminal() {
            return Ok(Box::pin(stream::iter(history)));
        }

        let last_seq = history.last().map(|chunk| chunk.seq);
        let (_subscriber_id, rx) = self.store.subscribe(job_uuid)?;
        let live = tokio_stream::wrappers::ReceiverStream::new(rx)
            .filter(move |chunk| futures::future::ready(last_seq.map_or(true, |seq| chunk.seq > seq)));
        Ok(Box::pin(stream::iter(history).chain(live)))
    }

    async fn run_workflow(&self, yaml_bytes: Vec<u8>) -> Result<Workflow> {
        let source_yaml = String::from_utf8_lossy(&yaml_bytes).into_owned();
        let spec = joblet_workflow::parse_workflow_yaml(&yaml_bytes)?;
        let validated = joblet_workflow::validate(spec, &self.fs, &self.network)?;
        self.workflows.run_workflow(source_yaml, validated).await
    }

    async fn get_workflow_status(&self, workflow_uuid: Uuid) -> Result<Workflow> {
        self.workflows
            .get(workflow_uuid)
            .ok_or_else(|| JobletError::not_found(workflow_uuid))
    }

    async fn list_workflows(&self) -> Vec<Workflow> {
        self.workflows.list()
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
    use joblet_base::limits::{HostInfo, Limits};
    use joblet_cgroup::CgroupManager;
    use joblet_exec::EngineConfig;
    use joblet_linux::FakePlatform;
    use joblet_network::veth::FakeVethControl;
    use joblet_scheduler::Scheduler;
    use slog::o;
    use std::time::Duration;

    /// Mirrors `joblet-workflow`'s test fixture: a zero-capacity `Engine` so `start_job` always
    /// fails with `Capacity` before touching any real namespace or cgroup.
    fn daemon() -> (Arc<Daemon>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let logger = Logger::root(slog::Discard, o!());
        let platform: Arc<dyn joblet_linux::Platform> = Arc::new(FakePlatform::new());
        let cgroup = CgroupManager::new(root.join("cgroup"), Arc::clone(&platform), logger.clone());
        let fs = Arc::new(FsIsolator::new(root.join("state"), Arc::clone(&platform), logger.clone()));
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
            FsIsolator::new(root.join("state"), Arc::clone(&platform), logger.clone()),
            Arc::clone(&network),
            Arc::clone(&logs),
            Arc::clone(&store),
            platform,
            host,
            EngineConfig {
                max_concurrent_jobs: 0,
                cleanup_timeout: Duration::from_secs(5),
                job_timeout: Duration::from_secs(3600),
                reexec_path: "/proc/self/exe".to_string(),
            },
            logger.clone(),
        );
        let starter = crate::starter::EngineJobStarter::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            Arc::clone(&logs),
            logger.clone(),
        );
        let scheduler = Scheduler::new(starter, logger.clone());
        let workflows = WorkflowEngine::new(Arc::clone(&engine), Arc::clone(&store), Arc::clone(&logs), logger.clone());
        let daemon = Daemon::new(engine, store, logs, scheduler, workflows, fs, network, logger);
        (daemon, tmp)
    }

    fn spec() -> JobSpec {
        JobSpec {
            command: "/bin/true".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_job_rejects_limits_exceeding_host_before_creating_job() {
        let (daemon, _tmp) = daemon();
        let spec = JobSpec {
            limits: Limits {
                max_memory_mb: u64::MAX,
                ..Default::default()
            },
            ..spec()
        };
        let err = daemon.run_job(spec).await.unwrap_err();
        assert!(matches!(err, JobletError::Validation(_)));
    }

    #[tokio::test]
    async fn run_job_that_exhausts_capacity_ends_up_failed() {
        let (daemon, _tmp) = daemon();
        let summary = daemon.run_job(spec()).await.unwrap();
        assert_eq!(summary.status, JobStatus::Initializing); // accepted synchronously, not yet failed

        // `spawn_immediate_start`'s fallback runs on a spawned task; give it a turn to land.
        for _ in 0..50 {
            if daemon.get_job_status(summary.uuid).await.unwrap().status == JobStatus::Failed {
                break;
            }
            tokio::task::yield_now().await;
        }
        let detail = daemon.get_job_status(summary.uuid).await.unwrap();
        assert_eq!(detail.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn get_job_status_on_unknown_uuid_is_not_found() {
        let (daemon, _tmp) = daemon();
        let err = daemon.get_job_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JobletError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_job_on_unknown_uuid_is_not_found() {
        let (daemon, _tmp) = daemon();
        let err = daemon.stop_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JobletError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_jobs_reflects_created_jobs() {
        let (daemon, _tmp) = daemon();
        daemon.run_job(spec()).await.unwrap();
        daemon.run_job(spec()).await.unwrap();
        assert_eq!(daemon.list_jobs(JobFilter::default()).await.len(), 2);
    }

    #[tokio::test]
    async fn get_job_logs_on_terminal_job_returns_finite_history_stream() {
        let (daemon, _tmp) = daemon();
        let summary = daemon.run_job(spec()).await.unwrap();
        for _ in 0..50 {
            if daemon.get_job_status(summary.uuid).await.unwrap().status == JobStatus::Failed {
                break;
            }
            tokio::task::yield_now().await;
        }
        let chunks: Vec<_> = daemon
            .get_job_logs(summary.uuid)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(chunks.iter().any(|c| c.stream == joblet_base::log::StreamTag::Control));
    }
}
