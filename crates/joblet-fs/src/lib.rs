//! Per-job filesystem isolation (C3): chroot assembly, runtime manifest parsing, and teardown.

pub mod isolator;
pub mod runtime;

pub use isolator::{FsIsolator, JobFs};
pub use runtime::{resolve_within, RuntimeManifest, RuntimeMount};
