//! GUI Notification Log (spec §6, `gui_notifications`).
//!
//! An append-only, bounded-to-100 event log external GUI shells poll for
//! human-facing status updates (task completions, workflow transitions).
//! Persisted as a flat JSON array via the same write-temp-then-rename
//! boundary helper every other state file uses.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ids::Wall;
use crate::sentinel;

const MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: String,
    pub message: String,
}

/// Bounded, file-backed event log. Oldest entries drop silently once the
/// cap is reached — there is no acknowledgement protocol, only a rolling
/// window for whatever is currently polling it.
pub struct NotificationLog {
    path: PathBuf,
    events: Mutex<VecDeque<NotificationEvent>>,
}

impl NotificationLog {
    pub fn start(path: PathBuf) -> Self {
        let events = load_or_init(&path);
        Self {
            path,
            events: Mutex::new(events),
        }
    }

    pub fn push(&self, category: impl Into<String>, message: impl Into<String>) {
        let event = NotificationEvent {
            timestamp: Wall::now(),
            category: category.into(),
            message: message.into(),
        };
        let snapshot = {
            let mut guard = self.events.lock();
            guard.push_back(event);
            while guard.len() > MAX_EVENTS {
                guard.pop_front();
            }
            guard.iter().cloned().collect::<Vec<_>>()
        };
        if let Err(e) = sentinel::atomic_write(&self.path, &serde_json::to_vec_pretty(&snapshot).unwrap_or_default())
        {
            warn!(error = %e, "failed to persist gui_notifications");
        }
    }

    pub fn snapshot(&self) -> Vec<NotificationEvent> {
        self.events.lock().iter().cloned().collect()
    }
}

fn load_or_init(path: &Path) -> VecDeque<NotificationEvent> {
    match std::fs::read(path) {
        Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or_default(),
        _ => VecDeque::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn push_persists_and_is_readable_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gui_notifications.json");
        let log = NotificationLog::start(path.clone());
        log.push("task", "task abc completed");
        assert_eq!(log.snapshot().len(), 1);

        let reloaded = NotificationLog::start(path);
        assert_eq!(reloaded.snapshot().len(), 1);
        assert_eq!(reloaded.snapshot()[0].message, "task abc completed");
    }

    #[test]
    fn bounded_to_one_hundred_events() {
        let dir = tempdir().unwrap();
        let log = NotificationLog::start(dir.path().join("gui_notifications.json"));
        for i in 0..150 {
            log.push("task", format!("event {i}"));
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), MAX_EVENTS);
        assert_eq!(snapshot[0].message, "event 50");
        assert_eq!(snapshot[MAX_EVENTS - 1].message, "event 149");
    }
}
