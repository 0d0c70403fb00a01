//! The execution engine (C8, §4.8): Stage A setup, supervision to terminal, and the stop
//! protocol. Stage B (what happens inside the child) is `joblet-init`.

use camino::Utf8PathBuf;
use chrono::Utc;
use joblet_base::error::{JobletError, Result};
use joblet_base::job::{JobSpec, JobStatus, NetworkMode, Outcome};
use joblet_base::limits::HostInfo;
use joblet_base::log::StreamTag;
use joblet_base::InitSpec;
use joblet_cgroup::CgroupManager;
use joblet_fs::{FsIsolator, RuntimeManifest};
use joblet_linux::{CloneFlags, Platform};
use joblet_logs::LogRegistry;
use joblet_network::NetworkManager;
use joblet_store::JobStore;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use slog::{error, info, warn, Logger};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::teardown::TeardownStep;

struct RunningJob {
    pid: Pid,
    stop_requested: Arc<AtomicBool>,
}

/// Orchestrates C2–C7 and C9 for every job, one instance per daemon process.
pub struct Engine {
    cgroup: CgroupManager,
    fs: FsIsolator,
    network: Arc<NetworkManager>,
    logs: Arc<LogRegistry>,
    store: Arc<JobStore>,
    platform: Arc<dyn Platform>,
    host: HostInfo,
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
    /// Fan-out of terminal-transition notifications. `joblet-workflow` subscribes one of these
    /// per daemon so it can react to a predecessor finishing without polling the store.
    terminal_subscribers: Mutex<Vec<mpsc::UnboundedSender<(Uuid, JobStatus)>>>,
    config: EngineConfig,
    logger: Logger,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cgroup: CgroupManager,
        fs: FsIsolator,
        network: Arc<NetworkManager>,
        logs: Arc<LogRegistry>,
        store: Arc<JobStore>,
        platform: Arc<dyn Platform>,
        host: HostInfo,
        config: EngineConfig,
        logger: Logger,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Arc::new(Engine {
            cgroup,
            fs,
            network,
            logs,
            store,
            platform,
            host,
            semaphore,
            running: Mutex::new(HashMap::new()),
            terminal_subscribers: Mutex::new(Vec::new()),
            config,
            logger,
        })
    }

    /// Registers interest in every job's terminal transition. Used by the workflow engine to
    /// drive dependency-gated admission (§4.11) off events instead of polling the store.
    pub fn subscribe_terminal(&self) -> mpsc::UnboundedReceiver<(Uuid, JobStatus)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.terminal_subscribers.lock().unwrap().push(tx);
        rx
    }

    fn notify_terminal(&self, job_uuid: Uuid, status: JobStatus) {
        self.terminal_subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send((job_uuid, status)).is_ok());
    }

    /// Exposes the host capacity `start_job` validates limits against, so a caller (the RPC front
    /// door) can reject a bad `JobSpec` before creating the job, per §7's "bad input never
    /// reaches side effects" rather than waiting for `start_job` itself to fail it.
    pub fn host_info(&self) -> HostInfo {
        self.host
    }

    /// Takes a job already present in the store (`Initializing`) through Stage A and into
    /// `Running`, then hands supervision off to a background task. Returns once the job is
    /// running or has definitively failed; does not wait for the job to finish.
    pub async fn start_job(self: &Arc<Self>, job_uuid: Uuid, spec: JobSpec) -> Result<()> {
        spec.limits.validate(&self.host)?;

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(JobletError::Capacity),
        };

        match self.run_stage_a(job_uuid, &spec).await {
            Ok((pid, output_read, exec_result_read, rollback)) => {
                self.logs.create_writer(job_uuid).await?;
                self.store.transition(
                    job_uuid,
                    JobStatus::Running,
                    Utc::now(),
                    Outcome::default(),
                )?;
                self.running.lock().unwrap().insert(
                    job_uuid,
                    RunningJob {
                        pid,
                        stop_requested: Arc::new(AtomicBool::new(false)),
                    },
                );
                info!(self.logger, "job running"; "job" => %job_uuid, "pid" => pid.as_raw());
                self.spawn_supervisor(job_uuid, pid, rollback, permit, output_read, exec_result_read);
                self.spawn_timeout_watcher(job_uuid, self.config.job_timeout);
                Ok(())
            }
            Err(err) => {
                let now = Utc::now();
                let _ = self
                    .store
                    .transition(job_uuid, JobStatus::Failed, now, Outcome::default());
                if let Some(writer) = self.logs.writer(job_uuid) {
                    let chunk = writer.diagnostic(now_ns(), &err.diagnostic_line());
                    let _ = self.store.publish(job_uuid, chunk).await;
                }
                warn!(self.logger, "stage a failed"; "job" => %job_uuid, "error" => %err);
                self.notify_terminal(job_uuid, JobStatus::Failed);
                Err(err)
            }
        }
    }

    /// Stage A, steps 2–8 of §4.8. Steps 1 (validate) and 9–10 (mark running, start pipe reader)
    /// live in `start_job` since they touch the job store / log registry rather than raw
    /// resources.
    async fn run_stage_a(
        &self,
        job_uuid: Uuid,
        spec: &JobSpec,
    ) -> Result<(Pid, OwnedFd, OwnedFd, Vec<TeardownStep>)> {
        let mut rollback: Vec<TeardownStep> = Vec::new();

        let handle = self.cgroup.create(job_uuid)?;
        // `apply_limits` destroys the cgroup itself on failure (§9), so there is nothing to push
        // onto `rollback` until it succeeds.
        self.cgroup.apply_limits(&handle, &spec.limits)?;
        rollback.push(TeardownStep::DestroyCgroup(handle.clone()));

        let reservation = match self.network.reserve(job_uuid, &spec.network) {
            Ok(r) => r,
            Err(err) => {
                self.run_teardown(rollback).await;
                return Err(err);
            }
        };
        rollback.push(TeardownStep::ReleaseNetwork(reservation));

        let job_fs = match self.fs.prepare(job_uuid, spec) {
            Ok(fs) => fs,
            Err(err) => {
                self.run_teardown(rollback).await;
                return Err(err);
            }
        };
        rollback.push(TeardownStep::TeardownFs(job_fs.clone()));

        let init_spec = self.build_init_spec(job_uuid, spec, &job_fs.root, &handle.path);
        let payload = match serde_json::to_vec(&init_spec) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.run_teardown(rollback).await;
                return Err(JobletError::Io(err.to_string()));
            }
        };

        let mut flags = CloneFlags::base();
        if !matches!(spec.network, NetworkMode::Host) {
            flags |= CloneFlags::NEWNET;
        }

        let spawn = match joblet_linux::spawn_init(flags, &self.config.reexec_path) {
            Ok(s) => s,
            Err(err) => {
                self.run_teardown(rollback).await;
                return Err(err);
            }
        };
        rollback.push(TeardownStep::KillChild(spawn.pid));

        if let Err(err) = write_spec_blob(spawn.spec_write, &payload) {
            self.run_teardown(rollback).await;
            return Err(err);
        }

        if let Err(err) = self.cgroup.attach(&handle, spawn.pid.as_raw() as u32) {
            self.run_teardown(rollback).await;
            return Err(err);
        }

        if let Some(TeardownStep::ReleaseNetwork(reservation)) = rollback
            .iter_mut()
            .find(|step| matches!(step, TeardownStep::ReleaseNetwork(_)))
        {
            if let Err(err) = self.network.attach_to_pid(reservation, spawn.pid.as_raw()) {
                self.run_teardown(rollback).await;
                return Err(err);
            }
        }

        Ok((spawn.pid, spawn.output_read, spawn.exec_result_read, rollback))
    }

    /// Merges runtime/job/secret environment into the flat map `joblet-init` expects, per §4.9
    /// step 8's overlay order (runtime env, then job env, then secret env, each overriding the
    /// last).
    fn build_init_spec(
        &self,
        job_uuid: Uuid,
        spec: &JobSpec,
        chroot_root: &Utf8PathBuf,
        cgroup_path: &Utf8PathBuf,
    ) -> InitSpec {
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        if let Some(runtime_name) = &spec.runtime {
            let runtime_dir = self.fs.runtimes_root().join(runtime_name);
            if let Ok(manifest) = RuntimeManifest::load(&runtime_dir) {
                env.extend(manifest.environment);
            }
        }
        env.extend(spec.env.clone());
        env.extend(spec.secret_env.clone());

        InitSpec {
            job_uuid,
            command: spec.command.clone(),
            args: spec.args.clone(),
            workdir: spec.workdir.clone(),
            env,
            chroot_root: chroot_root.clone(),
            cgroup_path: cgroup_path.clone(),
            network_mode: spec.network.clone(),
        }
    }

    /// Stop protocol (§4.8): SIGTERM to the process group, then an unconditional SIGKILL 100ms
    /// later. Idempotent; a no-op against an already-terminal or unknown job is treated as
    /// success the way `Job::transition`'s repeat-terminal case is.
    pub async fn stop(&self, job_uuid: Uuid) -> Result<()> {
        let target = {
            let running = self.running.lock().unwrap();
            running
                .get(&job_uuid)
                .map(|job| (job.pid, job.stop_requested.clone()))
        };
        let Some((pid, stop_requested)) = target else {
            return match self.store.get(job_uuid) {
                Some(_) => Ok(()),
                None => Err(JobletError::not_found(job_uuid)),
            };
        };

        stop_requested.store(true, Ordering::SeqCst);
        self.platform.signal_process_group(pid.as_raw(), Signal::SIGTERM)?;

        let platform = self.platform.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = platform.signal_process_group(pid.as_raw(), Signal::SIGKILL);
        });
        Ok(())
    }

    fn spawn_timeout_watcher(self: &Arc<Self>, job_uuid: Uuid, timeout: Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(job) = engine.store.get(job_uuid) {
                if !job.status.is_terminal() {
                    warn!(engine.logger, "job exceeded its timeout, stopping"; "job" => %job_uuid);
                    let _ = engine.stop(job_uuid).await;
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_supervisor(
        self: &Arc<Self>,
        job_uuid: Uuid,
        pid: Pid,
        rollback: Vec<TeardownStep>,
        permit: OwnedSemaphorePermit,
        output_read: OwnedFd,
        exec_result_read: OwnedFd,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let output_task = tokio::spawn(run_output_reader(
                engine.store.clone(),
                engine.logs.clone(),
                job_uuid,
                output_read,
            ));
            let exec_result_task =
                tokio::task::spawn_blocking(move || read_exec_result(exec_result_read));

            let wait_result =
                tokio::task::spawn_blocking(move || nix::sys::wait::waitpid(pid, None)).await;
            // Wait for the last output bytes to land before closing the job's log writer.
            let _ = output_task.await;
            let exec_message = exec_result_task.await.unwrap_or_default();

            engine
                .finish_job(job_uuid, pid, wait_result, exec_message, rollback)
                .await;
            drop(permit);
        });
    }

    async fn finish_job(
        &self,
        job_uuid: Uuid,
        pid: Pid,
        wait_result: std::result::Result<nix::Result<WaitStatus>, tokio::task::JoinError>,
        exec_message: Option<String>,
        rollback: Vec<TeardownStep>,
    ) {
        let stop_requested = self
            .running
            .lock()
            .unwrap()
            .remove(&job_uuid)
            .map(|job| job.stop_requested.load(Ordering::SeqCst))
            .unwrap_or(false);

        let now = Utc::now();
        let pid_u32 = Some(pid.as_raw() as u32);
        let (status, outcome) = if stop_requested {
            (
                JobStatus::Stopped,
                Outcome {
                    exit_code: Some(-1),
                    pid: pid_u32,
                },
            )
        } else {
            match wait_result {
                Ok(Ok(WaitStatus::Exited(_, code))) => {
                    let status = if code == 0 {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    (
                        status,
                        Outcome {
                            exit_code: Some(code),
                            pid: pid_u32,
                        },
                    )
                }
                Ok(Ok(WaitStatus::Signaled(_, signal, _))) => (
                    JobStatus::Failed,
                    Outcome {
                        exit_code: Some(-(signal as i32)),
                        pid: pid_u32,
                    },
                ),
                other => {
                    error!(self.logger, "wait() did not resolve to an exit status"; "job" => %job_uuid, "result" => ?other.ok());
                    (
                        JobStatus::Failed,
                        Outcome {
                            exit_code: None,
                            pid: pid_u32,
                        },
                    )
                }
            }
        };

        if let Some(message) = exec_message.filter(|m| !m.is_empty()) {
            if let Some(writer) = self.logs.writer(job_uuid) {
                let chunk = writer.diagnostic(now_ns(), &format!("[joblet] exec: {message}"));
                let _ = self.store.publish(job_uuid, chunk).await;
            }
        }

        let _ = self.store.transition(job_uuid, status, now, outcome);
        info!(self.logger, "job reached terminal state"; "job" => %job_uuid, "status" => %status);
        self.notify_terminal(job_uuid, status);
        self.logs.remove(job_uuid);
        self.run_teardown(rollback).await;
    }

    async fn run_teardown(&self, mut steps: Vec<TeardownStep>) {
        while let Some(step) = steps.pop() {
            match step {
                TeardownStep::KillChild(pid) => {
                    let _ = self.platform.signal_process_group(pid.as_raw(), Signal::SIGKILL);
                }
                TeardownStep::TeardownFs(job_fs) => self.fs.teardown(&job_fs),
                TeardownStep::ReleaseNetwork(reservation) => self.network.release(reservation),
                TeardownStep::DestroyCgroup(handle) => self.cgroup.destroy_async(&handle).await,
            }
        }
    }
}

async fn run_output_reader(
    store: Arc<JobStore>,
    logs: Arc<LogRegistry>,
    job_uuid: Uuid,
    output_read: OwnedFd,
) {
    use tokio::io::AsyncReadExt;
    // Both streams land on one pipe (§4.8 step 5 merges stdout/stderr before the child's
    // execve), so the per-chunk stream tag can only be `Stdout` here; a future split capture
    // would give this real fidelity.
    let mut file = tokio::fs::File::from_std(std::fs::File::from(output_read));
    let mut buf = vec![0u8; 8192];
    loop {
        match file.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(writer) = logs.writer(job_uuid) {
                    let chunk = writer.append(StreamTag::Stdout, buf[..n].to_vec(), now_ns());
                    let _ = store.publish(job_uuid, chunk).await;
                }
            }
        }
    }
}

/// Blocks (on a blocking-pool thread) until the exec-result pipe closes, returning whatever
/// message `joblet-init` wrote before a failed `execve`, or `None` on a clean exec (the pipe
/// closes empty because `joblet-init` marks the fd `CLOEXEC` before the real command runs).
fn read_exec_result(exec_result_read: OwnedFd) -> Option<String> {
    use std::io::Read;
    let mut file = std::fs::File::from(exec_result_read);
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}

fn write_spec_blob(spec_write: OwnedFd, payload: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::from(spec_write);
    file.write_all(payload).map_err(JobletError::from)
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
    use joblet_base::job::{JobSpec, NetworkMode, Upload};
    use joblet_base::limits::Limits;
    use joblet_linux::FakePlatform;
    use joblet_network::veth::FakeVethControl;
    use slog::o;

    fn engine(config: EngineConfig) -> Arc<Engine> {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::mem::forget(tmp); // keep the directory alive for the test's duration

        let logger = Logger::root(slog::Discard, o!());
        let platform: Arc<dyn Platform> = Arc::new(FakePlatform::new());
        let cgroup = CgroupManager::new(root.join("cgroup"), platform.clone(), logger.clone());
        let fs = FsIsolator::new(root.join("state"), platform.clone(), logger.clone());
        let network = Arc::new(NetworkManager::new(
            Box::new(FakeVethControl::new()),
            logger.clone(),
        ));
        let logs = Arc::new(joblet_logs::LogRegistry::new(
            root.join("logs"),
            joblet_logs::policy::OverflowPolicy::Alert,
            100,
            logger.clone(),
        ));
        let store = Arc::new(JobStore::new(logger.clone()));
        let host = HostInfo {
            cpu_cores: 4,
            memory_bytes: 16 * 1024 * 1024 * 1024,
            gpu_count: 0,
            gpu_memory_mb: 0,
        };
        Engine::new(cgroup, fs, network, logs, store, platform, host, config, logger)
    }

    fn spec() -> JobSpec {
        JobSpec {
            command: "/bin/echo".into(),
            network: NetworkMode::Host,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn capacity_exhausted_returns_capacity_error() {
        let engine = engine(EngineConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        });
        let err = engine
            .start_job(Uuid::new_v4(), spec())
            .await
            .unwrap_err();
        assert!(matches!(err, JobletError::Capacity));
    }

    #[tokio::test]
    async fn invalid_limits_rejected_before_any_resource_allocated() {
        let engine = engine(EngineConfig::default());
        let mut bad_spec = spec();
        bad_spec.limits = Limits {
            max_cpu_percent: 999_999,
            ..Default::default()
        };
        let err = engine.start_job(Uuid::new_v4(), bad_spec).await.unwrap_err();
        assert!(matches!(err, JobletError::Validation(_)));
    }

    #[tokio::test]
    async fn fs_prepare_failure_rolls_back_network_and_cgroup() {
        let engine = engine(EngineConfig::default());
        let job_uuid = Uuid::new_v4();
        let mut bad_spec = spec();
        bad_spec.network = NetworkMode::Bridge;
        bad_spec.uploads = vec![Upload {
            relative_path: "../../etc/passwd".into(),
            bytes: b"x".to_vec(),
        }];

        let err = engine.run_stage_a(job_uuid, &bad_spec).await.unwrap_err();
        assert!(matches!(err, JobletError::Validation(_)));

        // The address allocated during `reserve` must have been returned to the pool, so a
        // second reservation for a fresh job succeeds and the cgroup directory is gone.
        let second = engine.network.reserve(Uuid::new_v4(), &NetworkMode::Bridge);
        assert!(second.is_ok());
    }
}
