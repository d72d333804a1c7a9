//! Scheduler (component H, spec §4.8).
//!
//! Holds scheduled entries in a map, ticking at `min(tick, next_run - now)`
//! effectively by just ticking at a fixed cadence and checking due entries
//! each time — simpler and still correct since the tick interval (default
//! 30s) is small relative to any realistic schedule granularity.

pub mod schedule;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use schedule::{next_run_for, ScheduleKind, ScheduledEntry, TaskTemplate};

use crate::error::CoreResult;
use crate::ids::Id;
use crate::sentinel;
use crate::task::descriptor::TaskDescriptor;
use crate::task::manager::TaskManager;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleStoreData {
    entries: HashMap<String, ScheduledEntry>,
}

pub struct Scheduler {
    path: PathBuf,
    entries: Mutex<HashMap<Id, ScheduledEntry>>,
    manager: Arc<TaskManager>,
}

impl Scheduler {
    /// Load persisted entries (if any), recomputing `next_run` from
    /// `last_run` for each on startup (spec §4.8).
    pub fn start(path: PathBuf, manager: Arc<TaskManager>) -> Self {
        let mut data = load_or_init(&path);
        for entry in data.entries.values_mut() {
            if entry.enabled && !matches!(entry.schedule, ScheduleKind::Once { .. }) {
                entry.next_run = Some(next_run_for(&entry.schedule, entry.last_run, Utc::now()));
            }
        }
        let entries = data
            .entries
            .into_values()
            .map(|e| (e.id.clone(), e))
            .collect();
        Self {
            path,
            entries: Mutex::new(entries),
            manager,
        }
    }

    pub fn add(&self, name: impl Into<String>, template: TaskTemplate, schedule: ScheduleKind) -> CoreResult<Id> {
        let entry = ScheduledEntry::new(name, template, schedule);
        let id = entry.id.clone();
        self.entries.lock().insert(id.clone(), entry);
        self.persist()?;
        Ok(id)
    }

    pub fn remove(&self, id: &Id) -> CoreResult<bool> {
        let removed = self.entries.lock().remove(id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &Id, enabled: bool) -> CoreResult<bool> {
        let found = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(entry) => {
                    entry.enabled = enabled;
                    if enabled && entry.next_run.is_none() && !matches!(entry.schedule, ScheduleKind::Once { .. }) {
                        entry.next_run = Some(next_run_for(&entry.schedule, entry.last_run, Utc::now()));
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.persist()?;
        }
        Ok(found)
    }

    pub fn list(&self) -> Vec<ScheduledEntry> {
        self.entries.lock().values().cloned().collect()
    }

    /// Submit every entry whose `next_run <= now`, advance it, and persist.
    fn tick_once(&self) -> usize {
        let now = Utc::now();
        let mut due = Vec::new();
        {
            let mut entries = self.entries.lock();
            for entry in entries.values_mut() {
                if !entry.enabled {
                    continue;
                }
                if let Some(next_run) = entry.next_run {
                    if next_run <= now {
                        due.push(entry.template.clone());
                        entry.advance(now);
                    }
                }
            }
        }
        let count = due.len();
        for template in due {
            let descriptor = TaskDescriptor {
                id: Id::new(),
                kind: template.kind,
                task_type: template.task_type,
                priority: template.priority,
                submitted_at: now,
                deadline: None,
                timeout_seconds: template.timeout_seconds,
                requirements: template.requirements,
            };
            info!(task_id = %descriptor.id, "scheduler submitting due task");
            self.manager.submit(descriptor);
        }
        if count > 0 {
            if let Err(e) = self.persist() {
                warn!(error = %e, "failed to persist scheduler state after tick");
            }
        }
        count
    }

    fn persist(&self) -> CoreResult<()> {
        let entries = self.entries.lock();
        let data = ScheduleStoreData {
            entries: entries.values().map(|e| (e.id.as_str().to_string(), e.clone())).collect(),
        };
        drop(entries);
        let bytes = serde_json::to_vec_pretty(&data)?;
        sentinel::atomic_write(&self.path, &bytes)
    }

    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = self.persist();
                        break;
                    }
                }
            }
        }
    }
}

fn load_or_init(path: &PathBuf) -> ScheduleStoreData {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "scheduler store corrupt, archiving and resetting");
                let _ = sentinel::archive_corrupt(path);
                ScheduleStoreData::default()
            }
        },
        Err(_) => ScheduleStoreData::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceMonitorConfig, TaskManagerConfig};
    use crate::queue::TaskQueue;
    use crate::resource::AllocationController;
    use crate::task::descriptor::TaskKind;
    use tempfile::tempdir;

    fn template() -> TaskTemplate {
        TaskTemplate {
            kind: TaskKind::Command {
                program: "true".into(),
                args: vec![],
            },
            task_type: "utility".into(),
            priority: 1,
            timeout_seconds: 0,
            requirements: Default::default(),
        }
    }

    fn scheduler() -> (tempfile::TempDir, Scheduler) {
        let dir = tempdir().unwrap();
        let task_cfg = TaskManagerConfig::default();
        let controller = Arc::new(AllocationController::new(&ResourceMonitorConfig::default(), &task_cfg));
        let manager = Arc::new(TaskManager::new(task_cfg, Arc::new(TaskQueue::new()), controller));
        let sched = Scheduler::start(dir.path().join("schedule.json"), manager);
        (dir, sched)
    }

    #[test]
    fn due_interval_entry_submits_and_reschedules() {
        let (_d, sched) = scheduler();
        let id = sched
            .add("every-minute", template(), ScheduleKind::Interval { minutes: -1 })
            .unwrap();
        let submitted = sched.tick_once();
        assert_eq!(submitted, 1);
        let entry = sched.list().into_iter().find(|e| e.id == id).unwrap();
        assert!(entry.last_run.is_some());
        assert!(entry.next_run.unwrap() > Utc::now() - chrono::Duration::minutes(2));
    }

    #[test]
    fn disabled_entry_is_never_due() {
        let (_d, sched) = scheduler();
        let id = sched
            .add("paused", template(), ScheduleKind::Interval { minutes: -5 })
            .unwrap();
        sched.set_enabled(&id, false).unwrap();
        assert_eq!(sched.tick_once(), 0);
    }

    #[test]
    fn once_schedule_fires_exactly_once() {
        let (_d, sched) = scheduler();
        sched
            .add("one-shot", template(), ScheduleKind::Once { at: Utc::now() - chrono::Duration::seconds(1) })
            .unwrap();
        // Entry was created in the past, so ScheduledEntry::new disables it.
        assert_eq!(sched.tick_once(), 0);
    }

    #[test]
    fn persisted_store_reloads_with_recomputed_next_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        let task_cfg = TaskManagerConfig::default();
        let controller = Arc::new(AllocationController::new(&ResourceMonitorConfig::default(), &task_cfg));
        let manager = Arc::new(TaskManager::new(task_cfg, Arc::new(TaskQueue::new()), controller));
        let sched = Scheduler::start(path.clone(), manager.clone());
        sched.add("daily-job", template(), ScheduleKind::Daily { hour: 3, minute: 0 }).unwrap();

        let reloaded = Scheduler::start(path, manager);
        assert_eq!(reloaded.list().len(), 1);
        assert!(reloaded.list()[0].next_run.is_some());
    }
}
