//! Workflow engine (C11, §4.11): YAML DAG parsing, validation, and dependency-gated admission.

pub mod engine;
pub mod spec;
pub mod validate;

pub use engine::WorkflowEngine;
pub use spec::{parse_workflow_yaml, WorkflowSpec};
pub use validate::{validate, ValidatedJob, ValidatedWorkflow};
