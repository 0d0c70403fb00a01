//! `jobletd`: re-execs into init mode (C9) when spawned as a job's PID 1, otherwise starts the
//! daemon proper — wiring every component together and serving the RPC front door (§6) until a
//! graceful shutdown (SIGTERM/SIGINT) drains every running job.

use clap::Parser;
use joblet_base::limits::HostInfo;
use joblet_cgroup::CgroupManager;
use joblet_daemon::starter::EngineJobStarter;
use joblet_daemon::{graceful_shutdown, Daemon};
use joblet_exec::{Engine, EngineConfig};
use joblet_fs::FsIsolator;
use joblet_linux::LinuxPlatform;
use joblet_logs::LogRegistry;
use joblet_network::veth::IpCommandVeth;
use joblet_network::NetworkManager;
use joblet_scheduler::Scheduler;
use joblet_store::JobStore;
use joblet_util::config::Config;
use joblet_util::log::new_logger;
use joblet_util::process::ExitCode;
use joblet_workflow::WorkflowEngine;
use slog::info;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    if std::env::var_os("JOBLET_INIT_MODE").is_some() {
        // `joblet_init::run` never returns on the success path; it replaces this process image
        // with the job's command. By the time this branch runs, fds 1/2 already alias the job's
        // own output pipe (spawn.rs dup2's them there before the re-exec), so a real fd-backed
        // logger would write straight into the job's log stream. Init mode already reports every
        // failure through `exec_result_fd`, not through the logger, so a discarding logger is all
        // it needs.
        joblet_init::run(slog::Logger::root(slog::Discard, slog::o!()));
    }

    match run_daemon().await {
        Ok(()) => ExitCode::Success,
        Err(err) => {
            eprintln!("jobletd: startup failed: {err:#}");
            ExitCode::StartupFailure
        }
    }
}

async fn run_daemon() -> anyhow::Result<()> {
    let config = Config::parse();
    let logger = new_logger(config.log_level.into());
    info!(logger, "starting jobletd"; "state_root" => %config.state_root);

    let platform: Arc<dyn joblet_linux::Platform> = Arc::new(LinuxPlatform);
    let host = HostInfo::detect();

    let cgroup = CgroupManager::new(config.cgroup_root.clone(), Arc::clone(&platform), logger.clone());
    let fs = FsIsolator::new(config.state_root.clone(), Arc::clone(&platform), logger.clone());
    let network = Arc::new(NetworkManager::new(Box::new(IpCommandVeth), logger.clone()));

    let overflow_policy = joblet_logs::policy::OverflowPolicy::from_str(&config.overflow_policy)
        .unwrap_or_else(|_| joblet_logs::policy::OverflowPolicy::default());
    let logs = Arc::new(LogRegistry::new(
        config.state_root.join("logs"),
        overflow_policy,
        config.ring_capacity,
        logger.clone(),
    ));

    let store = Arc::new(
        JobStore::new(logger.clone())
            .with_subscriber_deadline(Duration::from_millis(config.subscriber_deadline_ms))
            .with_history_source(Arc::clone(&logs) as Arc<dyn joblet_store::HistorySource>),
    );

    let engine_config = EngineConfig {
        max_concurrent_jobs: config.max_concurrent_jobs,
        cleanup_timeout: Duration::from_secs(config.cleanup_timeout_secs),
        job_timeout: Duration::from_secs(config.job_timeout_secs),
        reexec_path: "/proc/self/exe".to_string(),
    };
    let engine = Engine::new(
        cgroup,
        fs,
        Arc::clone(&network),
        Arc::clone(&logs),
        Arc::clone(&store),
        Arc::clone(&platform),
        host,
        engine_config,
        logger.clone(),
    );

    let starter = EngineJobStarter::new(Arc::clone(&engine), Arc::clone(&store), Arc::clone(&logs), logger.clone());
    let scheduler = Scheduler::new(starter, logger.clone());
    scheduler.spawn_dispatcher();

    let workflows = WorkflowEngine::new(Arc::clone(&engine), Arc::clone(&store), Arc::clone(&logs), logger.clone());

    // `FsIsolator`/`NetworkManager` are consumed by `Engine` above; `Daemon` only needs them for
    // `RunWorkflow`'s upfront validation (§4.11), so it gets its own handles.
    let fs_for_validation = Arc::new(FsIsolator::new(
        config.state_root.clone(),
        Arc::clone(&platform),
        logger.clone(),
    ));
    // No transport is wired up here: the wire protocol is a collaborator this crate hands off
    // to, not something it implements (§1). `_daemon` exists for a future transport to serve.
    let _daemon = Daemon::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        Arc::clone(&logs),
        Arc::clone(&scheduler),
        workflows,
        fs_for_validation,
        Arc::clone(&network),
        logger.clone(),
    );

    graceful_shutdown(
        engine,
        store,
        Duration::from_secs(config.cleanup_timeout_secs),
        logger.clone(),
    )
    .await;
    Ok(())
}
