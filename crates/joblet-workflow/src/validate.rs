//! Workflow validation (§4.11): every violation is collected before any job is created, rather
//! than aborting on the first one found.

use crate::spec::{RawJobSpec, WorkflowSpec};
use camino::Utf8PathBuf;
use joblet_base::error::{JobletError, Result};
use joblet_base::job::{Dependency, JobSpec, JobStatus, NetworkMode};
use joblet_fs::FsIsolator;
use joblet_network::NetworkManager;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

pub struct ValidatedJob {
    pub name: String,
    pub spec: JobSpec,
}

pub struct ValidatedWorkflow {
    pub name: Option<String>,
    pub jobs: Vec<ValidatedJob>,
}

pub fn validate(
    spec: WorkflowSpec,
    fs: &FsIsolator,
    network: &NetworkManager,
) -> Result<ValidatedWorkflow> {
    let WorkflowSpec { name, jobs } = spec;
    let mut problems = Vec::new();

    let mut seen = HashSet::new();
    for (job_name, _) in &jobs {
        if !seen.insert(job_name.clone()) {
            problems.push(format!("duplicate job name: {job_name}"));
        }
    }
    let declared: HashSet<&str> = jobs.iter().map(|(n, _)| n.as_str()).collect();

    let mut parsed: Vec<(String, RawJobSpec, Vec<Dependency>)> = Vec::new();
    for (job_name, raw) in jobs {
        let mut deps = Vec::new();
        for entry in &raw.requires {
            if entry.len() != 1 {
                problems.push(format!(
                    "job {job_name}: each `requires` entry must name exactly one predecessor, found {}",
                    entry.len()
                ));
                continue;
            }
            let (predecessor, status_text) = entry.iter().next().unwrap();
            if !declared.contains(predecessor.as_str()) {
                problems.push(format!("job {job_name}: requires undeclared job {predecessor}"));
            }
            match JobStatus::from_str(status_text) {
                Ok(status) if status.is_terminal() => deps.push(Dependency {
                    predecessor_name: predecessor.clone(),
                    required_status: status,
                }),
                Ok(status) => problems.push(format!(
                    "job {job_name}: requires status {status} is not a terminal status"
                )),
                Err(_) => problems.push(format!(
                    "job {job_name}: unknown required status {status_text}"
                )),
            }
        }

        if let Some(runtime) = &raw.runtime {
            if !runtime_exists(fs, runtime) {
                problems.push(format!("job {job_name}: unknown runtime {runtime}"));
            }
        }
        for volume in &raw.volumes {
            if !volume_exists(fs, volume) {
                problems.push(format!("job {job_name}: unknown volume {volume}"));
            }
        }
        if let Some(NetworkMode::Custom(net_name)) = &raw.network {
            if !network.known_network(net_name) {
                problems.push(format!("job {job_name}: unknown network {net_name}"));
            }
        }

        parsed.push((job_name, raw, deps));
    }

    if !cycle_free(&parsed, &declared) {
        problems.push("workflow contains a dependency cycle".to_string());
    }

    if !problems.is_empty() {
        return Err(JobletError::validation(problems.join("; ")));
    }

    let jobs = parsed
        .into_iter()
        .map(|(job_name, raw, deps)| {
            let spec = JobSpec {
                name: Some(job_name.clone()),
                command: raw.command,
                args: raw.args,
                limits: raw.resources,
                network: raw.network.unwrap_or_default(),
                volumes: raw.volumes,
                runtime: raw.runtime,
                uploads: Vec::new(),
                workdir: raw.workdir.unwrap_or_else(|| Utf8PathBuf::from("/work")),
                env: raw.environment,
                secret_env: Default::default(),
                scheduled_time: None,
                dependencies: deps,
                workflow_id: None,
            };
            ValidatedJob { name: job_name, spec }
        })
        .collect();

    Ok(ValidatedWorkflow { name, jobs })
}

fn runtime_exists(fs: &FsIsolator, name: &str) -> bool {
    fs.runtimes_root().join(name).exists()
}

fn volume_exists(fs: &FsIsolator, name: &str) -> bool {
    fs.volumes_root().join(name).exists()
}

/// Kahn's algorithm: if the final topological order omits any declared job, a cycle exists.
fn cycle_free(parsed: &[(String, RawJobSpec, Vec<Dependency>)], declared: &HashSet<&str>) -> bool {
    let mut indegree: HashMap<&str, usize> = declared.iter().map(|&n| (n, 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for (job_name, _, deps) in parsed {
        for dep in deps {
            if declared.contains(dep.predecessor_name.as_str()) {
                successors
                    .entry(dep.predecessor_name.as_str())
                    .or_default()
                    .push(job_name.as_str());
                *indegree.entry(job_name.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut visited = HashSet::new();
    while let Some(job_name) = queue.pop_front() {
        if !visited.insert(job_name) {
            continue;
        }
        if let Some(succs) = successors.get(job_name) {
            for &succ in succs {
                if let Some(deg) = indegree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }
    visited.len() == indegree.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse_workflow_yaml;
    use joblet_linux::FakePlatform;
    use joblet_network::veth::FakeVethControl;
    use slog::{o, Logger};
    use std::sync::Arc;

    fn fixtures() -> (FsIsolator, NetworkManager, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let logger = Logger::root(slog::Discard, o!());
        let platform: Arc<dyn joblet_linux::Platform> = Arc::new(FakePlatform::new());
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let fs = FsIsolator::new(root.join("state"), platform, logger.clone());
        let network = NetworkManager::new(Box::new(FakeVethControl::new()), logger);
        (fs, network, tmp)
    }

    #[test]
    fn accepts_valid_linear_chain() {
        let (fs, network, _tmp) = fixtures();
        let spec = parse_workflow_yaml(
            b"
jobs:
  a:
    command: /bin/true
  b:
    command: /bin/true
    requires:
      - a: COMPLETED
",
        )
        .unwrap();
        let validated = validate(spec, &fs, &network).unwrap();
        assert_eq!(validated.jobs.len(), 2);
    }

    #[test]
    fn rejects_duplicate_names_and_cycle_in_one_error() {
        let (fs, network, _tmp) = fixtures();
        let spec = parse_workflow_yaml(
            b"
jobs:
  a:
    command: /bin/true
    requires:
      - b: COMPLETED
  b:
    command: /bin/true
    requires:
      - a: COMPLETED
",
        )
        .unwrap();
        let err = validate(spec, &fs, &network).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
    }

    #[test]
    fn rejects_undeclared_predecessor() {
        let (fs, network, _tmp) = fixtures();
        let spec = parse_workflow_yaml(
            b"
jobs:
  a:
    command: /bin/true
    requires:
      - ghost: COMPLETED
",
        )
        .unwrap();
        let err = validate(spec, &fs, &network).unwrap_err();
        assert!(err.to_string().contains("undeclared job ghost"));
    }

    #[test]
    fn rejects_non_terminal_required_status() {
        let (fs, network, _tmp) = fixtures();
        let spec = parse_workflow_yaml(
            b"
jobs:
  a:
    command: /bin/true
  b:
    command: /bin/true
    requires:
      - a: RUNNING
",
        )
        .unwrap();
        let err = validate(spec, &fs, &network).unwrap_err();
        assert!(err.to_string().contains("not a terminal status"));
    }

    #[test]
    fn rejects_unknown_custom_network() {
        let (fs, network, _tmp) = fixtures();
        let spec = parse_workflow_yaml(
            b"
jobs:
  a:
    command: /bin/true
    network:
      Custom: missing
",
        )
        .unwrap();
        let err = validate(spec, &fs, &network).unwrap_err();
        assert!(err.to_string().contains("unknown network missing"));
    }
}
