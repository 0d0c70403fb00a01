//! The `Job` data model and its status FSM (§3 of the design doc).

use crate::error::{JobletError, Result};
use crate::limits::Limits;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The network mode selection described in §4.4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    Host,
    None,
    Isolated,
    Bridge,
    Custom(String),
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Bridge
    }
}

/// An upload bundled with the job: a path relative to `/work` plus its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub relative_path: Utf8PathBuf,
    pub bytes: Vec<u8>,
}

/// A predecessor reference from a workflow job's `requires:` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub predecessor_name: String,
    pub required_status: JobStatus,
}

/// `Job.status`, per §3's FSM. `CREATED` is transient and is never observed outside `JobSpec`
/// construction, so it is not a variant here; a `Job` always starts life in `Initializing` or
/// `Scheduled`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Initializing,
    Scheduled,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Whether `self -> next` is a legal FSM edge, per the diagram in §3.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Scheduled, Initializing) => true,
            (Initializing, Running) => true,
            (Initializing, Failed) => true,
            (Running, Completed) => true,
            (Running, Failed) => true,
            (Running, Stopped) => true,
            // A job may also be stopped before it ever starts running, e.g. Stop() racing with
            // Stage A setup.
            (Initializing, Stopped) => true,
            (Scheduled, Stopped) => true,
            // Idempotent repeat of the same terminal state is allowed at the FSM layer; the job
            // store treats it as a no-op rather than an error.
            (a, b) if a == b && a.is_terminal() => true,
            _ => false,
        }
    }
}

/// Full specification of a job, as accepted by `RunJob` (§6). Distinct from `Job` in that it
/// carries no server-assigned fields (uuid, status, timing, outcome).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub command: String,
    pub args: Vec<String>,
    pub limits: Limits,
    pub network: NetworkMode,
    pub volumes: Vec<String>,
    pub runtime: Option<String>,
    pub uploads: Vec<Upload>,
    pub workdir: Utf8PathBuf,
    pub env: BTreeMap<String, String>,
    pub secret_env: BTreeMap<String, String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub dependencies: Vec<Dependency>,
}

impl Default for JobSpec {
    fn default() -> Self {
        JobSpec {
            name: None,
            workflow_id: None,
            command: String::new(),
            args: Vec::new(),
            limits: Limits::default(),
            network: NetworkMode::default(),
            volumes: Vec::new(),
            runtime: None,
            uploads: Vec::new(),
            workdir: Utf8PathBuf::from("/work"),
            env: BTreeMap::new(),
            secret_env: BTreeMap::new(),
            scheduled_time: None,
            dependencies: Vec::new(),
        }
    }
}

/// The outcome of a terminated job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

/// A server-tracked job: the spec plus everything the FSM and timing invariants in §3 add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: Outcome,
}

impl Job {
    pub fn new(uuid: Uuid, spec: JobSpec) -> Self {
        let status = if spec.scheduled_time.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Initializing
        };
        Job {
            uuid,
            spec,
            status,
            start_time: None,
            end_time: None,
            outcome: Outcome::default(),
        }
    }

    /// Redacts `secretEnv` for any outbound status/log response, per §3.
    pub fn redacted_env(&self) -> BTreeMap<String, String> {
        self.spec.env.clone()
    }

    /// Validates and applies a status transition in place, maintaining the timing invariants from
    /// §3: `startTime` set iff the job ever reached `Running`; `endTime` set iff terminal;
    /// `exitCode` set iff terminal with a known code.
    pub fn transition(
        &mut self,
        next: JobStatus,
        now: DateTime<Utc>,
        outcome: Outcome,
    ) -> Result<()> {
        if self.status == next && next.is_terminal() {
            // Idempotent: repeat transitions to the same terminal state are no-ops (§4.6).
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(JobletError::state(format!(
                "job {} is already terminal ({}), cannot transition to {}",
                self.uuid, self.status, next
            )));
        }
        if !self.status.can_transition_to(next) {
            return Err(JobletError::state(format!(
                "job {} cannot transition from {} to {}",
                self.uuid, self.status, next
            )));
        }
        if next == JobStatus::Running {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.end_time = Some(now);
            self.outcome = outcome;
        }
        self.status = next;
        Ok(())
    }
}
