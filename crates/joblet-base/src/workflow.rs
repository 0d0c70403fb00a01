//! The `Workflow` aggregate (§3). DAG parsing and validation live in `joblet-workflow`; this is
//! just the data that the job store and the core track once a workflow has been accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowCounters {
    pub total: u32,
    pub started: u32,
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub source_yaml: String,
    /// Job name -> server-assigned job UUID, derived deterministically from
    /// `(workflow uuid, job name)` per the supplement in the expanded spec, so a workflow can be
    /// re-queried without maintaining a separate name index.
    pub job_uuids: BTreeMap<String, Uuid>,
    pub status: WorkflowStatus,
    pub counters: WorkflowCounters,
}

impl Workflow {
    /// Deterministic per-job UUID derivation: UUIDv5 over the workflow UUID namespace and the job
    /// name. Two calls with the same `(workflow_uuid, job_name)` always agree.
    pub fn derive_job_uuid(workflow_uuid: Uuid, job_name: &str) -> Uuid {
        Uuid::new_v5(&workflow_uuid, job_name.as_bytes())
    }

    pub fn recompute_status(&mut self) {
        if self.counters.failed > 0 {
            self.status = WorkflowStatus::Failed;
        } else if self.counters.completed == self.counters.total && self.counters.total > 0 {
            self.status = WorkflowStatus::Completed;
        } else if self.counters.started > 0 {
            self.status = WorkflowStatus::Running;
        } else {
            self.status = WorkflowStatus::Pending;
        }
    }
}
