//! Resource Monitor & Allocation Controller subsystem (components B and C).

pub mod controller;
pub mod sampler;
pub mod types;

pub use controller::AllocationController;
pub use sampler::ResourceSampler;
pub use types::{AllocationStrategy, Metric, ProcessRow, ResourceSnapshot, SnapshotRing, StrategyKind};
