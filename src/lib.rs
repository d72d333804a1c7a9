//! Parallel task orchestration core: priority dispatch, resource-aware
//! admission control, scheduling, and session/file coordination for a
//! multi-agent automation platform.
//!
//! See [`composition::Orchestrator`] for the single entry point that wires
//! every component together.

pub mod composition;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod ids;
pub mod locks;
pub mod notifications;
pub mod queue;
pub mod resource;
pub mod scheduler;
pub mod sentinel;
pub mod session;
pub mod snapshot;
pub mod task;
pub mod workflow;

pub use composition::Orchestrator;
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
