//! Execution engine (C8, §4.8): Stage A setup, supervision, the stop protocol, and the
//! concurrency cap. Stage B is `joblet-init`.

pub mod config;
pub mod engine;
pub mod teardown;

pub use config::EngineConfig;
pub use engine::Engine;
pub use teardown::TeardownStep;
