//! Workflow execution (§4.11): dependency-gated admission and failure propagation, driven by the
//! execution engine's terminal-transition notifications (`Engine::subscribe_terminal`) rather
//! than polling the job store.

use crate::validate::ValidatedWorkflow;
use chrono::Utc;
use joblet_base::error::Result;
use joblet_base::job::{JobSpec, JobStatus, Outcome};
use joblet_base::workflow::{Workflow, WorkflowCounters, WorkflowStatus};
use joblet_exec::Engine;
use joblet_logs::LogRegistry;
use joblet_store::JobStore;
use slog::{info, warn, Logger};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct JobNode {
    job_uuid: Uuid,
    spec: JobSpec,
    /// Unmet dependency count; the job is admitted to `C8` the moment this reaches zero.
    pending: usize,
    admitted: bool,
}

struct WorkflowState {
    workflow: Workflow,
    nodes: HashMap<String, JobNode>,
    uuid_to_name: HashMap<Uuid, String>,
    /// predecessor job name -> names of jobs that `requires` it.
    dependents: HashMap<String, Vec<String>>,
}

/// One instance per daemon process tracks every concurrently running workflow (§5: "one
/// workflow-engine task per active workflow" is realized here as one listener task fed by the
/// shared `Engine`, rather than a task per workflow, since every workflow's jobs flow through the
/// same terminal-transition channel).
pub struct WorkflowEngine {
    engine: Arc<Engine>,
    store: Arc<JobStore>,
    logs: Arc<LogRegistry>,
    workflows: Mutex<HashMap<Uuid, WorkflowState>>,
    job_to_workflow: Mutex<HashMap<Uuid, Uuid>>,
    logger: Logger,
}

impl WorkflowEngine {
    pub fn new(engine: Arc<Engine>, store: Arc<JobStore>, logs: Arc<LogRegistry>, logger: Logger) -> Arc<Self> {
        let this = Arc::new(WorkflowEngine {
            engine,
            store,
            logs,
            workflows: Mutex::new(HashMap::new()),
            job_to_workflow: Mutex::new(HashMap::new()),
            logger,
        });
        Arc::clone(&this).spawn_listener();
        this
    }

    fn spawn_listener(self: Arc<Self>) {
        let mut terminal = self.engine.subscribe_terminal();
        tokio::spawn(async move {
            while let Some((job_uuid, status)) = terminal.recv().await {
                self.on_job_terminal(job_uuid, status).await;
            }
        });
    }

    pub fn get(&self, workflow_uuid: Uuid) -> Option<Workflow> {
        self.workflows
            .lock()
            .unwrap()
            .get(&workflow_uuid)
            .map(|state| state.workflow.clone())
    }

    pub fn list(&self) -> Vec<Workflow> {
        self.workflows
            .lock()
            .unwrap()
            .values()
            .map(|state| state.workflow.clone())
            .collect()
    }

    /// Registers every job's store entry, then admits whichever ones have no predecessors.
    /// Per §6's `RunWorkflow`, the caller gets the summary back immediately; jobs that still have
    /// unmet dependencies stay `Initializing` in the store until admitted.
    pub async fn run_workflow(&self, source_yaml: String, validated: ValidatedWorkflow) -> Result<Workflow> {
        let workflow_uuid = Uuid::new_v4();
        let job_uuids: std::collections::BTreeMap<String, Uuid> = validated
            .jobs
            .iter()
            .map(|job| (job.name.clone(), Workflow::derive_job_uuid(workflow_uuid, &job.name)))
            .collect();

        let mut nodes = HashMap::new();
        let mut uuid_to_name = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for job in validated.jobs {
            let mut spec = job.spec;
            spec.workflow_id = Some(workflow_uuid);
            for dep in &spec.dependencies {
                dependents
                    .entry(dep.predecessor_name.clone())
                    .or_default()
                    .push(job.name.clone());
            }
            let job_uuid = job_uuids[&job.name];
            uuid_to_name.insert(job_uuid, job.name.clone());
            self.job_to_workflow.lock().unwrap().insert(job_uuid, workflow_uuid);
            self.store.create(job_uuid, spec.clone())?;
            let pending = spec.dependencies.len();
            nodes.insert(
                job.name.clone(),
                JobNode {
                    job_uuid,
                    spec,
                    pending,
                    admitted: false,
                },
            );
        }

        let total = nodes.len() as u32;
        let workflow = Workflow {
            uuid: workflow_uuid,
            name: validated.name,
            source_yaml,
            job_uuids,
            status: WorkflowStatus::Pending,
            counters: WorkflowCounters {
                total,
                started: 0,
                completed: 0,
                failed: 0,
            },
        };

        self.workflows.lock().unwrap().insert(
            workflow_uuid,
            WorkflowState {
                workflow,
                nodes,
                uuid_to_name,
                dependents,
            },
        );

        info!(self.logger, "workflow registered"; "workflow" => %workflow_uuid, "jobs" => total);

        let ready: Vec<(Uuid, JobSpec)> = {
            let workflows = self.workflows.lock().unwrap();
            workflows
                .get(&workflow_uuid)
                .unwrap()
                .nodes
                .values()
                .filter(|node| node.pending == 0)
                .map(|node| (node.job_uuid, node.spec.clone()))
                .collect()
        };
        for (job_uuid, spec) in ready {
            self.admit(workflow_uuid, job_uuid, spec).await;
        }

        Ok(self.workflows.lock().unwrap().get(&workflow_uuid).unwrap().workflow.clone())
    }

    async fn admit(&self, workflow_uuid: Uuid, job_uuid: Uuid, spec: JobSpec) {
        {
            let mut workflows = self.workflows.lock().unwrap();
            if let Some(state) = workflows.get_mut(&workflow_uuid) {
                if let Some(node) = state
                    .nodes
                    .values_mut()
                    .find(|node| node.job_uuid == job_uuid)
                {
                    node.admitted = true;
                }
                state.workflow.counters.started += 1;
                state.workflow.recompute_status();
            }
        }

        if let Err(err) = self.engine.start_job(job_uuid, spec).await {
            // `start_job` only transitions the job to `Failed` itself once Stage A begins; a
            // validation or capacity error returned before that point leaves the job sitting in
            // `Initializing`, so the workflow engine closes it out directly here.
            warn!(self.logger, "workflow job failed to start"; "job" => %job_uuid, "error" => %err);
            let _ = self
                .store
                .transition(job_uuid, JobStatus::Failed, Utc::now(), Outcome::default());
            if let Ok(writer) = self.logs.create_writer(job_uuid).await {
                let chunk = writer.diagnostic(now_ns(), &format!("[joblet] workflow: {err}"));
                let _ = self.store.publish(job_uuid, chunk).await;
            }
            self.logs.remove(job_uuid);
            self.handle_terminal(workflow_uuid, job_uuid, JobStatus::Failed).await;
        }
    }

    async fn on_job_terminal(&self, job_uuid: Uuid, status: JobStatus) {
        let workflow_uuid = match self.job_to_workflow.lock().unwrap().get(&job_uuid).copied() {
            Some(workflow_uuid) => workflow_uuid,
            None => return,
        };
        self.handle_terminal(workflow_uuid, job_uuid, status).await;
    }

    /// Updates counters, then walks the dependent graph breadth-first: a satisfied dependency
    /// admits its job; an unsatisfiable one fails it with the synthetic reason §4.11 specifies,
    /// and that failure cascades to its own dependents in the same pass.
    async fn handle_terminal(&self, workflow_uuid: Uuid, job_uuid: Uuid, status: JobStatus) {
        let mut to_admit = Vec::new();
        let mut to_fail: Vec<(Uuid, String)> = Vec::new();

        {
            let mut workflows = self.workflows.lock().unwrap();
            let Some(state) = workflows.get_mut(&workflow_uuid) else {
                return;
            };
            let Some(job_name) = state.uuid_to_name.get(&job_uuid).cloned() else {
                return;
            };

            match status {
                JobStatus::Completed => state.workflow.counters.completed += 1,
                JobStatus::Failed | JobStatus::Stopped => state.workflow.counters.failed += 1,
                _ => {}
            }

            let mut queue = VecDeque::new();
            queue.push_back((job_name, status));
            while let Some((finished_name, finished_status)) = queue.pop_front() {
                let Some(dependent_names) = state.dependents.get(&finished_name).cloned() else {
                    continue;
                };
                for dependent_name in dependent_names {
                    let Some(node) = state.nodes.get(&dependent_name) else {
                        continue;
                    };
                    if node.admitted {
                        continue;
                    }
                    let required = node
                        .spec
                        .dependencies
                        .iter()
                        .find(|dep| dep.predecessor_name == finished_name)
                        .map(|dep| dep.required_status);
                    let Some(required_status) = required else {
                        continue;
                    };

                    if required_status == finished_status {
                        let node = state.nodes.get_mut(&dependent_name).unwrap();
                        node.pending = node.pending.saturating_sub(1);
                        if node.pending == 0 {
                            to_admit.push((workflow_uuid, node.job_uuid, node.spec.clone()));
                        }
                    } else {
                        let node = state.nodes.get_mut(&dependent_name).unwrap();
                        node.admitted = true;
                        state.workflow.counters.failed += 1;
                        let reason = format!(
                            "predecessor {finished_name} ended in {finished_status}, required {required_status}"
                        );
                        to_fail.push((node.job_uuid, reason));
                        queue.push_back((dependent_name, JobStatus::Failed));
                    }
                }
            }

            state.workflow.recompute_status();
        }

        for (job_uuid, reason) in to_fail {
            let _ = self
                .store
                .transition(job_uuid, JobStatus::Failed, Utc::now(), Outcome::default());
            if let Ok(writer) = self.logs.create_writer(job_uuid).await {
                let chunk = writer.diagnostic(now_ns(), &format!("[joblet] workflow: {reason}"));
                let _ = self.store.publish(job_uuid, chunk).await;
            }
            self.logs.remove(job_uuid);
            info!(self.logger, "workflow job failed by propagation"; "job" => %job_uuid, "reason" => reason);
        }
        for (workflow_uuid, job_uuid, spec) in to_admit {
            self.admit(workflow_uuid, job_uuid, spec).await;
        }
    }
}

fn now_ns() -> i128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i128
}
