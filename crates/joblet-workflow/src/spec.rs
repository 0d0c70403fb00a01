//! Workflow YAML parsing (§6): a top-level `jobs:` mapping of `jobName -> job spec`, each
//! optionally followed by a `requires:` list of single-key `{predecessorName: REQUIRED_STATUS}`
//! entries.
//!
//! `jobs` deserializes into an ordered `Vec<(String, RawJobSpec)>` rather than a `BTreeMap` so
//! that a document with the same job name twice isn't silently collapsed before validation gets a
//! chance to report it (§4.11's "duplicate job names" check).

use camino::Utf8PathBuf;
use joblet_base::error::{JobletError, Result};
use joblet_base::job::NetworkMode;
use joblet_base::limits::Limits;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Deserialize)]
pub struct RawJobSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network: Option<NetworkMode>,
    #[serde(default)]
    pub resources: Limits,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub requires: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub name: Option<String>,
    pub jobs: Vec<(String, RawJobSpec)>,
}

impl<'de> Deserialize<'de> for WorkflowSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Shape {
            #[serde(default)]
            name: Option<String>,
            jobs: OrderedJobs,
        }
        let shape = Shape::deserialize(deserializer)?;
        Ok(WorkflowSpec {
            name: shape.name,
            jobs: shape.jobs.0,
        })
    }
}

struct OrderedJobs(Vec<(String, RawJobSpec)>);

impl<'de> Deserialize<'de> for OrderedJobs {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct JobsVisitor;

        impl<'de> Visitor<'de> for JobsVisitor {
            type Value = OrderedJobs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of job name to job spec")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, RawJobSpec>()? {
                    entries.push(entry);
                }
                Ok(OrderedJobs(entries))
            }
        }

        deserializer.deserialize_map(JobsVisitor)
    }
}

/// Parses the raw YAML bytes of a `RunWorkflow` request into a [`WorkflowSpec`]. Malformed YAML
/// is a `ValidationError`, same as any other bad-input rejection (§7).
pub fn parse_workflow_yaml(bytes: &[u8]) -> Result<WorkflowSpec> {
    serde_yaml::from_slice(bytes)
        .map_err(|err| JobletError::validation(format!("invalid workflow YAML: {err}")))
}
