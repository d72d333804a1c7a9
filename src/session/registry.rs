//! Session Registry (component D, spec §4.4).
//!
//! Classifies the current process's session type by inspecting
//! parent-process name, environment hints, cwd, and argv[0] (in that tie-
//! break order), persists the active/completed session map to a shared
//! file, and arbitrates conflicts between concurrently active sessions
//! using a fixed priority table.
//!
//! Grounded in `original_source/.../session_detector.py`'s
//! `_detect_current_session` / `has_conflicting_sessions`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tracing::{info, warn};

use super::types::{ArbitrationOutcome, SessionRecord, SessionType};
use crate::config::{ArbitrationPolicy, SessionConfig};
use crate::error::CoreResult;
use crate::ids::Id;
use crate::sentinel;

/// On-disk shape of the `active sessions` state file (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionStoreData {
    active_sessions: HashMap<String, SessionRecord>,
    completed_sessions: HashMap<String, SessionRecord>,
    last_updated: Option<chrono::DateTime<Utc>>,
}

pub struct SessionRegistry {
    path: PathBuf,
    policy: ArbitrationPolicy,
    stale_after: chrono::Duration,
    data: Mutex<SessionStoreData>,
    current_id: Id,
}

impl SessionRegistry {
    /// Start the registry: load the shared file, classify and register the
    /// current process's session.
    pub fn start(path: PathBuf, config: &SessionConfig) -> CoreResult<Self> {
        let data = load_or_init(&path);
        let current_type = classify_current_session();
        let current_id = Id::tagged(session_type_tag(current_type));

        let record = SessionRecord {
            session_id: current_id.clone(),
            session_type: current_type,
            pid: std::process::id(),
            parent_pid: parent_pid(),
            started_at: Utc::now(),
            ended_at: None,
            hints: classification_hints(),
        };

        let registry = Self {
            path,
            policy: config.arbitration_policy,
            stale_after: chrono::Duration::hours(config.stale_after_hours as i64),
            data: Mutex::new(data),
            current_id,
        };

        {
            let mut guard = registry.data.lock();
            guard
                .active_sessions
                .insert(registry.current_id.as_str().to_string(), record);
        }
        registry.persist()?;
        info!(session_type = ?current_type, id = %registry.current_id, "session registered");
        Ok(registry)
    }

    pub fn current(&self) -> SessionRecord {
        let guard = self.data.lock();
        guard
            .active_sessions
            .get(self.current_id.as_str())
            .cloned()
            .expect("current session always present once started")
    }

    pub fn active(&self) -> Vec<SessionRecord> {
        self.data.lock().active_sessions.values().cloned().collect()
    }

    /// Active peers whose type conflicts with the current session's type
    /// (spec §4.4).
    pub fn conflicts(&self) -> Vec<SessionRecord> {
        let current_type = self.current().session_type;
        self.data
            .lock()
            .active_sessions
            .values()
            .filter(|r| r.session_id != self.current_id && current_type.conflicts(r.session_type))
            .cloned()
            .collect()
    }

    /// Arbitrate against every conflicting peer: the current session only
    /// continues if it outranks (or ties) all of them.
    pub fn arbitrate(&self) -> ArbitrationOutcome {
        let current_priority = self.current().session_type.priority();
        let conflicts = self.conflicts();
        let outranked = conflicts
            .iter()
            .any(|peer| peer.session_type.priority() > current_priority);

        if !outranked {
            return ArbitrationOutcome::Continue;
        }

        match self.policy {
            ArbitrationPolicy::Continue => ArbitrationOutcome::Continue,
            ArbitrationPolicy::Yield => ArbitrationOutcome::Pause,
            ArbitrationPolicy::Ask => ArbitrationOutcome::Ask,
        }
    }

    /// One sweep: drop any active record whose pid no longer exists or
    /// whose age exceeds the configured staleness window, moving it to
    /// completed.
    pub fn sweep(&self, sys: &System) -> CoreResult<()> {
        let now = Utc::now();
        let mut moved = Vec::new();
        {
            let mut guard = self.data.lock();
            let stale_ids: Vec<String> = guard
                .active_sessions
                .iter()
                .filter(|(id, r)| {
                    id.as_str() != self.current_id.as_str()
                        && (!sys.processes().contains_key(&sysinfo::Pid::from_u32(r.pid))
                            || now - r.started_at > self.stale_after)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale_ids {
                if let Some(mut record) = guard.active_sessions.remove(&id) {
                    record.ended_at = Some(now);
                    guard.completed_sessions.insert(id, record.clone());
                    moved.push(record);
                }
            }
        }
        if !moved.is_empty() {
            for r in &moved {
                warn!(session_id = %r.session_id, "session swept as stale");
            }
            self.persist()?;
        }
        Ok(())
    }

    pub fn unregister_current(&self) -> CoreResult<()> {
        let mut guard = self.data.lock();
        if let Some(mut record) = guard.active_sessions.remove(self.current_id.as_str()) {
            record.ended_at = Some(Utc::now());
            guard
                .completed_sessions
                .insert(self.current_id.as_str().to_string(), record);
        }
        drop(guard);
        self.persist()
    }

    fn persist(&self) -> CoreResult<()> {
        let mut guard = self.data.lock();
        guard.last_updated = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&*guard)?;
        drop(guard);
        sentinel::atomic_write(&self.path, &bytes)
    }
}

fn load_or_init(path: &PathBuf) -> SessionStoreData {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "active sessions file corrupt, archiving and resetting");
                let _ = sentinel::archive_corrupt(path);
                SessionStoreData::default()
            }
        },
        Err(_) => SessionStoreData::default(),
    }
}

fn session_type_tag(t: SessionType) -> &'static str {
    match t {
        SessionType::Terminal => "terminal",
        SessionType::GuiWorkflow => "gui_workflow",
        SessionType::EditorAgent => "editor_agent",
        SessionType::ManualScript => "manual_script",
        SessionType::Unknown => "unknown",
    }
}

fn parent_pid() -> Option<u32> {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(sysinfo::Pid::from_u32(std::process::id()))
        .and_then(|p| p.parent())
        .map(|p| p.as_u32())
}

fn classification_hints() -> Vec<String> {
    let mut hints = Vec::new();
    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        hints.push("anthropic_api_key".to_string());
    }
    for (k, _) in std::env::vars() {
        if k.starts_with("VSCODE_") {
            hints.push("editor_env".to_string());
            break;
        }
    }
    if std::env::var("TERM").is_ok() || std::env::var("SHELL").is_ok() {
        hints.push("terminal_env".to_string());
    }
    if let Ok(cwd) = std::env::current_dir() {
        if cwd.to_string_lossy().to_lowercase().contains("gui") {
            hints.push("gui_working_dir".to_string());
        }
    }
    hints
}

/// Classification order per spec §4.4: parent-process name, environment
/// hints, cwd, argv[0], ties broken in that order.
fn classify_current_session() -> SessionType {
    let mut sys = System::new();
    sys.refresh_processes();
    let pid = sysinfo::Pid::from_u32(std::process::id());

    if let Some(process) = sys.process(pid) {
        if let Some(parent_pid) = process.parent() {
            if let Some(parent) = sys.process(parent_pid) {
                let name = parent.name().to_lowercase();
                if ["bash", "zsh", "fish", "powershell", "cmd", "terminal", "wt"]
                    .iter()
                    .any(|t| name.contains(t))
                {
                    return SessionType::Terminal;
                }
                if name.contains("code") || name.contains("vscode") {
                    return SessionType::EditorAgent;
                }
                if name.contains("python") && process.cwd().to_string_lossy().to_lowercase().contains("gui") {
                    return SessionType::GuiWorkflow;
                }
            }
        }
    }

    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        return SessionType::Terminal;
    }
    for (k, _) in std::env::vars() {
        if k.starts_with("VSCODE_") {
            return SessionType::EditorAgent;
        }
    }
    if std::env::var("TERM").is_ok() || std::env::var("SHELL").is_ok() {
        return SessionType::Terminal;
    }
    if let Ok(cwd) = std::env::current_dir() {
        if cwd.to_string_lossy().to_lowercase().contains("gui") {
            return SessionType::GuiWorkflow;
        }
    }
    if let Some(arg0) = std::env::args().next() {
        if arg0.ends_with(".py") || arg0.ends_with(".sh") {
            return SessionType::ManualScript;
        }
    }
    SessionType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn start_registers_current_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let registry = SessionRegistry::start(path, &SessionConfig::default()).unwrap();
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn unregister_moves_record_to_completed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let registry = SessionRegistry::start(path.clone(), &SessionConfig::default()).unwrap();
        registry.unregister_current().unwrap();
        assert!(registry.active().is_empty());

        let bytes = std::fs::read(&path).unwrap();
        let data: SessionStoreData = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(data.completed_sessions.len(), 1);
    }

    #[test]
    fn priority_table_matches_spec() {
        assert_eq!(SessionType::GuiWorkflow.priority(), 10);
        assert_eq!(SessionType::Terminal.priority(), 8);
        assert_eq!(SessionType::EditorAgent.priority(), 6);
        assert_eq!(SessionType::ManualScript.priority(), 4);
        assert_eq!(SessionType::Unknown.priority(), 2);
    }

    #[test]
    fn terminal_and_gui_conflict_symmetrically() {
        assert!(SessionType::Terminal.conflicts(SessionType::GuiWorkflow));
        assert!(SessionType::GuiWorkflow.conflicts(SessionType::Terminal));
        assert!(!SessionType::ManualScript.conflicts(SessionType::Terminal));
    }
}
