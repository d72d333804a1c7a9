//! File Lock Registry subsystem (component E, spec §4.5).

pub mod registry;
pub mod types;

pub use registry::FileLockRegistry;
pub use types::{FileLockEntry, LockMode};
