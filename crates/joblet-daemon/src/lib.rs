//! Wiring for the `jobletd` binary: the RPC front door (§6, trait-abstracted since the wire
//! protocol itself is out of scope), the scheduler's `JobStarter`, and graceful shutdown.

pub mod service;
pub mod shutdown;
pub mod starter;

pub use service::{Daemon, JobDetail, JobSummary, JobletService};
pub use shutdown::graceful_shutdown;
