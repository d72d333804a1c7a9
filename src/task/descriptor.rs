//! Task descriptor (spec §3) — immutable after submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// What kind of payload a task runs, replacing the source's dynamic
/// reflection / duck-typed task dicts with a sealed variant (spec §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run an external script as a subprocess.
    Script { path: String, args: Vec<String> },
    /// Invoke an in-process function by symbolic name.
    Function { name: String, args: Vec<String> },
    /// Run an arbitrary command as a subprocess.
    Command { program: String, args: Vec<String> },
}

/// Optional resource requirements a task declares at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub gpu: bool,
}

/// Immutable submission record describing what to run (spec §3, glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: Id,
    pub kind: TaskKind,
    /// Free-form tag used for per-type concurrency caps, e.g. `heavy-render`.
    pub task_type: String,
    pub priority: i64,
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// `0` means "no timeout" (spec §5, strongly discouraged).
    pub timeout_seconds: u64,
    pub requirements: ResourceRequirements,
}

impl TaskDescriptor {
    pub fn new(kind: TaskKind, task_type: impl Into<String>, priority: i64, timeout_seconds: u64) -> Self {
        Self {
            id: Id::new(),
            kind,
            task_type: task_type.into(),
            priority,
            submitted_at: Utc::now(),
            deadline: None,
            timeout_seconds,
            requirements: ResourceRequirements::default(),
        }
    }
}

fn default_task_type() -> String {
    "utility".to_string()
}

/// Unnormalized request as written to `task_creation_queue` (spec §6): a
/// collaborator names what to run without constructing the id/timestamp a
/// submitted `TaskDescriptor` carries. The Task Manager normalizes these
/// into `automation_queue` on each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTaskRequest {
    pub kind: TaskKind,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub requirements: ResourceRequirements,
}

impl RawTaskRequest {
    pub fn normalize(self) -> TaskDescriptor {
        TaskDescriptor {
            id: Id::new(),
            kind: self.kind,
            task_type: self.task_type,
            priority: self.priority,
            submitted_at: Utc::now(),
            deadline: None,
            timeout_seconds: self.timeout_seconds,
            requirements: self.requirements,
        }
    }
}
