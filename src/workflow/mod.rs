//! Workflow Status Store (component I, spec §4.9).
//!
//! A small state machine (stopped/running/paused) with transitions
//! serialized behind one mutex. Every transition writes the workflow status
//! file plus three sentinel files external workers poll (spec §6):
//! `terminate_status`, `workflow_pause`, and a state-mirror boolean file. A
//! background poll loop consumes the `workflow_command`/`workflow_request`
//! control files and drives these same transitions from outside the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::notifications::NotificationLog;
use crate::sentinel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatedAgent {
    pub info: Value,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub state: WorkflowState,
    pub total_run_time_seconds: i64,
    pub pause_count: u64,
    pub active_count: usize,
    pub paused_count: usize,
    pub terminated_count: usize,
}

struct Inner {
    state: WorkflowState,
    started_at: Option<DateTime<Utc>>,
    total_run_time_seconds: i64,
    pause_count: u64,
    active_agents: HashMap<String, Value>,
    paused_agents: HashMap<String, Value>,
    terminated_agents: HashMap<String, TerminatedAgent>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: WorkflowState::Stopped,
            started_at: None,
            total_run_time_seconds: 0,
            pause_count: 0,
            active_agents: HashMap::new(),
            paused_agents: HashMap::new(),
            terminated_agents: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowStatusData {
    state: WorkflowState,
    last_updated: DateTime<Utc>,
    active_agents: HashMap<String, Value>,
    paused_agents: HashMap<String, Value>,
    terminated_agents: HashMap<String, TerminatedAgent>,
    statistics: StatsData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatsData {
    total_run_time_seconds: i64,
    pause_count: u64,
}

pub struct WorkflowStore {
    status_path: PathBuf,
    terminate_sentinel: PathBuf,
    pause_sentinel: PathBuf,
    state_flag_sentinel: PathBuf,
    command_path: PathBuf,
    request_path: PathBuf,
    notifications: Option<Arc<NotificationLog>>,
    inner: Mutex<Inner>,
}

impl WorkflowStore {
    /// `state_root` is the versioned directory under which all
    /// sentinel/status/control files live (spec §6).
    pub fn start(state_root: impl AsRef<Path>) -> CoreResult<Self> {
        let root = state_root.as_ref();
        let store = Self {
            status_path: root.join("workflow.json"),
            terminate_sentinel: root.join("terminate_status.json"),
            pause_sentinel: root.join("workflow_pause.json"),
            state_flag_sentinel: root.join("workflow_running.json"),
            command_path: root.join("workflow_command.json"),
            request_path: root.join("workflow_request.json"),
            notifications: None,
            inner: Mutex::new(Inner::default()),
        };
        store.persist()?;
        Ok(store)
    }

    /// Attach the `gui_notifications` event log (spec §6): every applied
    /// state transition is appended to it.
    pub fn with_notifications(mut self, log: Arc<NotificationLog>) -> Self {
        self.notifications = Some(log);
        self
    }

    fn notify(&self, message: &str) {
        if let Some(log) = &self.notifications {
            log.push("workflow", message);
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.inner.lock().state
    }

    /// stopped → running. Clears agent maps and resets counters for a fresh run.
    pub fn start_run(&self) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            if inner.state != WorkflowState::Stopped {
                false
            } else {
                inner.state = WorkflowState::Running;
                inner.started_at = Some(Utc::now());
                inner.total_run_time_seconds = 0;
                inner.pause_count = 0;
                inner.active_agents.clear();
                inner.paused_agents.clear();
                inner.terminated_agents.clear();
                true
            }
        };
        if applied {
            info!("workflow started");
            self.persist()?;
            self.notify("workflow started");
        }
        Ok(applied)
    }

    /// running → paused. Active agents move to paused.
    pub fn pause(&self) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            if inner.state != WorkflowState::Running {
                false
            } else {
                inner.state = WorkflowState::Paused;
                inner.pause_count += 1;
                let moved: Vec<(String, Value)> = inner.active_agents.drain().collect();
                inner.paused_agents.extend(moved);
                true
            }
        };
        if applied {
            info!("workflow paused");
            self.persist()?;
            self.notify("workflow paused");
        }
        Ok(applied)
    }

    /// paused → running. Paused agents move back to active.
    pub fn resume(&self) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            if inner.state != WorkflowState::Paused {
                false
            } else {
                inner.state = WorkflowState::Running;
                let moved: Vec<(String, Value)> = inner.paused_agents.drain().collect();
                inner.active_agents.extend(moved);
                true
            }
        };
        if applied {
            info!("workflow resumed");
            self.persist()?;
            self.notify("workflow resumed");
        }
        Ok(applied)
    }

    /// {running,paused} → stopped. Accumulates elapsed run time.
    pub fn stop(&self) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            if inner.state == WorkflowState::Stopped {
                false
            } else {
                if let Some(started) = inner.started_at.take() {
                    inner.total_run_time_seconds += (Utc::now() - started).num_seconds().max(0);
                }
                inner.state = WorkflowState::Stopped;
                true
            }
        };
        if applied {
            info!("workflow stopped");
            self.persist()?;
            self.notify("workflow stopped");
        }
        Ok(applied)
    }

    /// Poll `workflow_command`/`workflow_request` until `shutdown` fires,
    /// applying whatever external-control transition each holds (spec §2,
    /// §6). This is how a running core ever changes workflow state: nothing
    /// in-process calls `start_run`/`pause`/`resume`/`stop` on its own.
    pub async fn run_control_loop(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_control_files(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn poll_control_files(&self) {
        match sentinel::take_control_object::<Value>(&self.command_path) {
            Ok(Some(value)) => self.apply_command(value),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read workflow_command"),
        }
        match sentinel::take_control_object::<Value>(&self.request_path) {
            Ok(Some(value)) => self.apply_request(value),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read workflow_request"),
        }
    }

    fn apply_command(&self, value: Value) {
        let command = value.get("command").and_then(Value::as_str).unwrap_or_default();
        let result = match command {
            "stop" => self.stop(),
            "pause" => self.pause(),
            "resume" => self.resume(),
            other => {
                warn!(command = other, "unknown workflow_command, ignoring");
                return;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, command, "failed to apply workflow_command");
        }
    }

    fn apply_request(&self, value: Value) {
        let action = value.get("action").and_then(Value::as_str).unwrap_or_default();
        let result = match action {
            "start" => self.start_run(),
            // `WorkflowStore` has no configurable parameters today, so
            // "configure" is accepted and consumed but otherwise a no-op —
            // an Open Question decision (see DESIGN.md) rather than a
            // rejection, since the spec leaves the parameter shape to §6's
            // "..." and none of those params exist on this store yet.
            "configure" => {
                info!("workflow_request configure: no configurable parameters, acknowledged as a no-op");
                Ok(true)
            }
            other => {
                warn!(action = other, "unknown workflow_request action, ignoring");
                return;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, action, "failed to apply workflow_request");
        }
    }

    pub fn register_agent(&self, id: impl Into<String>, info: Value) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            if inner.state != WorkflowState::Running {
                false
            } else {
                inner.active_agents.insert(id.into(), info);
                true
            }
        };
        if applied {
            self.persist()?;
        }
        Ok(applied)
    }

    pub fn unregister_agent(&self, id: &str, reason: impl Into<String>) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            let info = inner
                .active_agents
                .remove(id)
                .or_else(|| inner.paused_agents.remove(id));
            match info {
                Some(info) => {
                    inner.terminated_agents.insert(
                        id.to_string(),
                        TerminatedAgent {
                            info,
                            reason: reason.into(),
                        },
                    );
                    true
                }
                None => false,
            }
        };
        if applied {
            self.persist()?;
        }
        Ok(applied)
    }

    /// Shallow-merge `patch` into the agent's current info object, wherever
    /// it currently lives (active or paused).
    pub fn update_agent(&self, id: &str, patch: Value) -> CoreResult<bool> {
        let applied = {
            let mut inner = self.inner.lock();
            let target = inner
                .active_agents
                .get_mut(id)
                .or_else(|| inner.paused_agents.get_mut(id));
            match target {
                Some(info) => {
                    merge_json(info, patch);
                    true
                }
                None => false,
            }
        };
        if applied {
            self.persist()?;
        }
        Ok(applied)
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock();
        let live_elapsed = inner
            .started_at
            .map(|s| (Utc::now() - s).num_seconds().max(0))
            .unwrap_or(0);
        Stats {
            state: inner.state,
            total_run_time_seconds: inner.total_run_time_seconds + live_elapsed,
            pause_count: inner.pause_count,
            active_count: inner.active_agents.len(),
            paused_count: inner.paused_agents.len(),
            terminated_count: inner.terminated_agents.len(),
        }
    }

    /// For Snapshot/Recovery: mark this workflow as interrupted by a host
    /// restart rather than a clean stop (spec §4.10). Does not touch agent
    /// maps — those belong to the Task Manager's own restart handling.
    pub fn mark_interrupted_by_restart(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.started_at = None;
        inner.state = WorkflowState::Stopped;
        drop(inner);
        self.persist()
    }

    fn persist(&self) -> CoreResult<()> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let status = WorkflowStatusData {
            state: inner.state,
            last_updated: now,
            active_agents: inner.active_agents.clone(),
            paused_agents: inner.paused_agents.clone(),
            terminated_agents: inner.terminated_agents.clone(),
            statistics: StatsData {
                total_run_time_seconds: inner.total_run_time_seconds,
                pause_count: inner.pause_count,
            },
        };
        let state = inner.state;
        drop(inner);

        sentinel::atomic_write(&self.status_path, &serde_json::to_vec_pretty(&status)?)?;
        sentinel::atomic_write(
            &self.terminate_sentinel,
            &serde_json::to_vec(&(state == WorkflowState::Stopped))?,
        )?;
        sentinel::atomic_write(
            &self.pause_sentinel,
            &serde_json::to_vec(&serde_json::json!({
                "paused": state == WorkflowState::Paused,
                "timestamp": now,
            }))?,
        )?;
        sentinel::atomic_write(
            &self.state_flag_sentinel,
            &serde_json::to_vec(&(state == WorkflowState::Running))?,
        )
    }
}

fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(target_map.entry(k).or_insert(Value::Null), v);
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, WorkflowStore) {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::start(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn start_then_pause_moves_active_to_paused() {
        let (_d, store) = store();
        store.start_run().unwrap();
        store.register_agent("a1", serde_json::json!({"kind": "render"})).unwrap();
        assert!(store.pause().unwrap());
        let stats = store.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.paused_count, 1);
        assert_eq!(stats.state, WorkflowState::Paused);
    }

    #[test]
    fn resume_moves_paused_back_to_active() {
        let (_d, store) = store();
        store.start_run().unwrap();
        store.register_agent("a1", serde_json::json!({})).unwrap();
        store.pause().unwrap();
        assert!(store.resume().unwrap());
        assert_eq!(store.stats().active_count, 1);
    }

    #[test]
    fn invalid_transition_is_a_noop() {
        let (_d, store) = store();
        // pause before start: invalid.
        assert!(!store.pause().unwrap());
        assert_eq!(store.state(), WorkflowState::Stopped);
    }

    #[test]
    fn start_clears_agent_maps_from_a_prior_run() {
        let (_d, store) = store();
        store.start_run().unwrap();
        store.register_agent("a1", serde_json::json!({})).unwrap();
        store.stop().unwrap();
        store.start_run().unwrap();
        assert_eq!(store.stats().active_count, 0);
    }

    #[test]
    fn unregister_moves_agent_to_terminated_with_reason() {
        let (_d, store) = store();
        store.start_run().unwrap();
        store.register_agent("a1", serde_json::json!({})).unwrap();
        assert!(store.unregister_agent("a1", "completed").unwrap());
        assert_eq!(store.stats().terminated_count, 1);
    }

    #[test]
    fn sentinel_files_are_written_on_every_transition() {
        let (dir, store) = store();
        store.start_run().unwrap();
        let flag: bool = serde_json::from_slice(&std::fs::read(dir.path().join("workflow_running.json")).unwrap()).unwrap();
        assert!(flag);
        store.stop().unwrap();
        let flag: bool = serde_json::from_slice(&std::fs::read(dir.path().join("workflow_running.json")).unwrap()).unwrap();
        assert!(!flag);
    }

    #[test]
    fn workflow_request_start_is_consumed_and_applied() {
        let (dir, store) = store();
        sentinel::atomic_write(dir.path().join("workflow_request.json"), br#"{"action":"start"}"#).unwrap();
        store.poll_control_files();
        assert_eq!(store.state(), WorkflowState::Running);
        assert!(!dir.path().join("workflow_request.json").exists());
    }

    #[test]
    fn workflow_command_pause_then_resume() {
        let (dir, store) = store();
        store.start_run().unwrap();

        sentinel::atomic_write(dir.path().join("workflow_command.json"), br#"{"command":"pause"}"#).unwrap();
        store.poll_control_files();
        assert_eq!(store.state(), WorkflowState::Paused);

        sentinel::atomic_write(dir.path().join("workflow_command.json"), br#"{"command":"resume"}"#).unwrap();
        store.poll_control_files();
        assert_eq!(store.state(), WorkflowState::Running);
    }

    #[test]
    fn unknown_command_is_ignored_without_error() {
        let (dir, store) = store();
        store.start_run().unwrap();
        sentinel::atomic_write(dir.path().join("workflow_command.json"), br#"{"command":"bogus"}"#).unwrap();
        store.poll_control_files();
        assert_eq!(store.state(), WorkflowState::Running);
    }
}
