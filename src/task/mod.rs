//! Task Queue consumer: descriptor/state types, the dispatcher, and worker
//! execution (components F–G, spec §4.6–§4.7).

pub mod descriptor;
pub mod manager;
pub mod registry;
pub mod state;
pub mod worker;

pub use descriptor::{RawTaskRequest, ResourceRequirements, TaskDescriptor, TaskKind};
pub use manager::{CompletedRecord, ManagerStatus, TaskManager};
pub use registry::{FunctionExecutor, FunctionRegistry};
pub use state::{TaskState, TaskStatus};
