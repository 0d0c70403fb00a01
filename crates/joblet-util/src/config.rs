//! Daemon configuration: a `clap::Parser`-derived struct with `env`-fallback flags, since
//! Joblet's layout is a fixed root rather than XDG-directory-relative.

use crate::log::LogLevel;
use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "jobletd", version, about = "Joblet job-execution daemon")]
pub struct Config {
    /// Root of the daemon's owned filesystem layout (§6): jobs/, logs/, runtimes/, volumes/.
    #[arg(long, env = "JOBLET_STATE_ROOT", default_value = "/opt/joblet")]
    pub state_root: Utf8PathBuf,

    /// Root of the cgroup v2 hierarchy this daemon manages.
    #[arg(
        long,
        env = "JOBLET_CGROUP_ROOT",
        default_value = "/sys/fs/cgroup/joblet.slice/joblet.service"
    )]
    pub cgroup_root: Utf8PathBuf,

    /// Maximum number of jobs running concurrently (§4.8).
    #[arg(long, env = "JOBLET_MAX_CONCURRENT_JOBS", default_value_t = 100)]
    pub max_concurrent_jobs: usize,

    /// Slow-subscriber deadline, in milliseconds (§4.6).
    #[arg(long, env = "JOBLET_SUBSCRIBER_DEADLINE_MS", default_value_t = 100)]
    pub subscriber_deadline_ms: u64,

    /// How long cgroup destruction retries before giving up (§4.2).
    #[arg(long, env = "JOBLET_CLEANUP_TIMEOUT_SECS", default_value_t = 5)]
    pub cleanup_timeout_secs: u64,

    /// Global per-job wall-clock timeout (§4.8).
    #[arg(long, env = "JOBLET_JOB_TIMEOUT_SECS", default_value_t = 3600)]
    pub job_timeout_secs: u64,

    /// How long the init process waits for the network-ready sentinel (§4.9).
    #[arg(long, env = "JOBLET_NETWORK_READY_TIMEOUT_SECS", default_value_t = 10)]
    pub network_ready_timeout_secs: u64,

    /// Minimum log level to emit.
    #[arg(long, env = "JOBLET_LOG_LEVEL", value_enum, default_value_t = LogLevelArg::Info)]
    pub log_level: LogLevelArg,

    /// CIDR of the default `joblet0` bridge (§4.4).
    #[arg(long, env = "JOBLET_BRIDGE_CIDR", default_value = "172.20.0.0/16")]
    pub bridge_cidr: String,

    /// Default log ring-buffer overflow policy (§4.7).
    #[arg(long, env = "JOBLET_OVERFLOW_POLICY", default_value = "alert")]
    pub overflow_policy: String,

    /// Default log ring-buffer capacity, in chunks (§4.7).
    #[arg(long, env = "JOBLET_RING_CAPACITY", default_value_t = 100_000)]
    pub ring_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
}

impl From<LogLevelArg> for LogLevel {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
        }
    }
}

impl std::fmt::Display for LogLevelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevelArg::Error => "error",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Info => "info",
            LogLevelArg::Debug => "debug",
        };
        write!(f, "{s}")
    }
}
