//! Session Registry subsystem (component D, spec §4.4).

pub mod registry;
pub mod types;

pub use registry::SessionRegistry;
pub use types::{ArbitrationOutcome, SessionRecord, SessionType};
