//! Mutable task runtime state (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::concurrency::CancelToken;

/// Lifecycle status. Transitions are one-directional: once a task leaves
/// `Queued` it never returns to it, and every terminal state is final
/// (spec §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

/// Runtime state attached to a [`super::descriptor::TaskDescriptor`] once it
/// enters the manager. The cancellation token is process-local only — it is
/// never serialized, since a restarted process cannot resume a cancelled-in-
/// flight worker (spec §4.10 treats those as "stopped: host restart").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub result_blob: Option<serde_json::Value>,
    pub error_blob: Option<String>,
    #[serde(skip, default = "CancelToken::new")]
    pub cancel_token: CancelToken,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Queued,
            started_at: None,
            ended_at: None,
            exit_code: None,
            result_blob: None,
            error_blob: None,
            cancel_token: CancelToken::new(),
        }
    }
}

impl TaskState {
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, exit_code: i32, result_blob: Option<serde_json::Value>) {
        self.status = TaskStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
        self.result_blob = result_blob;
    }

    pub fn mark_failed(&mut self, exit_code: Option<i32>, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.exit_code = exit_code;
        self.error_blob = Some(error.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.ended_at = Some(Utc::now());
        self.cancel_token.cancel();
    }

    pub fn mark_timed_out(&mut self) {
        self.status = TaskStatus::TimedOut;
        self.ended_at = Some(Utc::now());
        self.cancel_token.cancel();
    }

    pub fn mark_stopped(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Stopped;
        self.ended_at = Some(Utc::now());
        self.error_blob = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_queued_and_not_terminal() {
        let state = TaskState::default();
        assert_eq!(state.status, TaskStatus::Queued);
        assert!(!state.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut state = TaskState::default();
        state.mark_running();
        assert!(!state.status.is_terminal());
        state.mark_completed(0, None);
        assert!(state.status.is_terminal());
    }

    #[test]
    fn cancel_signals_the_token() {
        let mut state = TaskState::default();
        let token = state.cancel_token.clone();
        state.mark_cancelled();
        assert!(token.is_cancelled());
    }
}
