//! The error taxonomy from the design doc's error-handling section.
//!
//! Every fallible public API in the workspace returns a [`JobletError`] (or wraps one via
//! `anyhow::Context` at a crate boundary). The taxonomy is a closed set on purpose: callers match
//! on `kind()` to decide retry/log/surface behavior, rather than matching on crate-specific error
//! types.

use derive_more::{Display, From};
use std::fmt;

/// The `kind` carried by a [`JobletError::Resource`], identifying which subsystem failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResourceErrorKind {
    CgroupCreate,
    CgroupAttach,
    CgroupLimit,
    Mount,
    Chroot,
    Netns,
    Veth,
    IpAlloc,
}

/// The taxonomy of errors the core can produce. See the design doc's error-handling section for
/// the propagation policy attached to each variant.
#[derive(Debug, Display, From)]
pub enum JobletError {
    /// Bad input; never reaches side effects; surfaced to the caller verbatim.
    #[display(fmt = "validation error: {}", _0)]
    Validation(String),

    /// A resource-layer operation (cgroups, mounts, namespaces, networking) failed. Surfaced as
    /// internal to the caller, logged with context, triggers rollback.
    #[display(fmt = "resource error ({}): {}", kind, message)]
    #[from(ignore)]
    Resource {
        kind: ResourceErrorKind,
        message: String,
    },

    /// A required invariant failed (e.g. a runtime mount source escaping the runtime directory).
    /// Fatal for the job.
    #[display(fmt = "isolation invariant violated: {}", _0)]
    Isolation(String),

    /// `maxConcurrentJobs` reached. Retriable by the caller.
    #[display(fmt = "at capacity")]
    Capacity,

    /// Unknown UUID.
    #[display(fmt = "not found: {}", _0)]
    NotFound(String),

    /// An FSM transition was rejected. Idempotent callers should treat this as success.
    #[display(fmt = "invalid state transition: {}", _0)]
    State(String),

    /// A transient storage or pipe error. The log pipeline handles these under its overflow
    /// policy; the supervisor treats a persistent IOError on the job pipe as child death.
    #[display(fmt = "io error: {}", _0)]
    #[from(ignore)]
    Io(String),
}

impl JobletError {
    pub fn resource(kind: ResourceErrorKind, message: impl Into<String>) -> Self {
        JobletError::Resource {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        JobletError::Validation(message.into())
    }

    pub fn isolation(message: impl Into<String>) -> Self {
        JobletError::Isolation(message.into())
    }

    pub fn not_found(uuid: impl fmt::Display) -> Self {
        JobletError::NotFound(uuid.to_string())
    }

    pub fn state(message: impl Into<String>) -> Self {
        JobletError::State(message.into())
    }

    /// Formats this error the way §7 requires diagnostic log chunks to read:
    /// `[joblet] <kind>: <message>`.
    pub fn diagnostic_line(&self) -> String {
        let (kind, message) = match self {
            JobletError::Validation(m) => ("validation", m.clone()),
            JobletError::Resource { kind, message } => {
                (kind_name(*kind), message.clone())
            }
            JobletError::Isolation(m) => ("isolation", m.clone()),
            JobletError::Capacity => ("capacity", "max concurrent jobs reached".to_string()),
            JobletError::NotFound(m) => ("not_found", m.clone()),
            JobletError::State(m) => ("state", m.clone()),
            JobletError::Io(m) => ("io", m.clone()),
        };
        format!("[joblet] {kind}: {message}")
    }
}

fn kind_name(kind: ResourceErrorKind) -> &'static str {
    match kind {
        ResourceErrorKind::CgroupCreate => "cgroup_create",
        ResourceErrorKind::CgroupAttach => "cgroup_attach",
        ResourceErrorKind::CgroupLimit => "cgroup_limit",
        ResourceErrorKind::Mount => "mount",
        ResourceErrorKind::Chroot => "chroot",
        ResourceErrorKind::Netns => "netns",
        ResourceErrorKind::Veth => "veth",
        ResourceErrorKind::IpAlloc => "ip_alloc",
    }
}

impl std::error::Error for JobletError {}

impl From<std::io::Error> for JobletError {
    fn from(err: std::io::Error) -> Self {
        JobletError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobletError>;
