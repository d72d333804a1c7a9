//! File Lock Registry (component E, spec §4.5).
//!
//! Reader/writer locks keyed by canonical absolute path, with priority
//! preemption and TTL-based stale reclamation. All mutation is serialized
//! behind a single mutex (spec §5); the registry persists the full map to
//! JSON after each mutation, debounced to at most once per 250ms. Staleness
//! is computed from the monotonic clock (spec §9): `acquired_at` is a wall
//! timestamp kept for persistence/display only and never enters the TTL
//! comparison, so a backward wall-clock adjustment can't misfire the sweep.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::{normalize_duration, FileLockEntry, LockMode};
use crate::error::CoreResult;
use crate::ids::{Id, MonoClock};
use crate::sentinel;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LockStoreData {
    file_locks: HashMap<String, FileLockEntry>,
    workflows: HashMap<String, WorkflowPriorityInfo>,
    last_updated: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowPriorityInfo {
    priority: i64,
    rolled_back: bool,
}

/// Preemption threshold from spec §4.5: requester must exceed the current
/// holder's priority by more than this to evict it.
const PREEMPT_MARGIN: i64 = 2;

pub struct FileLockRegistry {
    path: PathBuf,
    data: Mutex<LockStoreData>,
    last_persist: Mutex<Option<std::time::Instant>>,
    debounce: Duration,
    clock: MonoClock,
}

impl FileLockRegistry {
    pub fn start(path: PathBuf) -> Self {
        let data = load_or_init(&path);
        Self {
            path,
            data: Mutex::new(data),
            last_persist: Mutex::new(None),
            debounce: Duration::from_millis(250),
            clock: MonoClock,
        }
    }

    /// Request a lock on `path` for `role` (an opaque holder identity, e.g.
    /// a task or session id).
    ///
    /// Returns `true` if granted. Always sweeps the path's entry first.
    pub fn request(
        &self,
        path: &str,
        role: &str,
        mode: LockMode,
        expected_duration_seconds: i64,
        workflow_id: Option<Id>,
        priority: i64,
    ) -> CoreResult<bool> {
        let expected_duration_seconds = normalize_duration(expected_duration_seconds);
        let granted = {
            let mut guard = self.data.lock();
            self.sweep_locked(&mut guard, Some(path));

            match guard.file_locks.get_mut(path) {
                None => {
                    let mut holders = std::collections::HashSet::new();
                    holders.insert(role.to_string());
                    guard.file_locks.insert(
                        path.to_string(),
                        FileLockEntry {
                            path: path.to_string(),
                            mode,
                            holders,
                            owning_workflow_id: workflow_id,
                            acquired_at: Utc::now(),
                            expected_duration_seconds,
                            pid: std::process::id(),
                            priority,
                            acquired_mono: Some(self.clock.now()),
                        },
                    );
                    true
                }
                Some(entry) if entry.mode == LockMode::Read && mode == LockMode::Read => {
                    entry.holders.insert(role.to_string());
                    true
                }
                Some(entry)
                    if entry.mode == LockMode::Write
                        && entry.holders.contains(role)
                        && mode == LockMode::Write =>
                {
                    // Reentrant: same exclusive holder re-requesting.
                    entry.expected_duration_seconds =
                        entry.expected_duration_seconds.max(expected_duration_seconds);
                    entry.acquired_at = Utc::now();
                    entry.acquired_mono = Some(self.clock.now());
                    true
                }
                Some(entry) => {
                    let holder_priority = entry.priority;
                    if priority > holder_priority + PREEMPT_MARGIN {
                        if let Some(wid) = &entry.owning_workflow_id {
                            guard
                                .workflows
                                .entry(wid.as_str().to_string())
                                .and_modify(|w| w.rolled_back = true)
                                .or_insert(WorkflowPriorityInfo {
                                    priority: holder_priority,
                                    rolled_back: true,
                                });
                            warn!(path, workflow = %wid, "lock preempted by higher-priority requester");
                        }
                        let mut holders = std::collections::HashSet::new();
                        holders.insert(role.to_string());
                        guard.file_locks.insert(
                            path.to_string(),
                            FileLockEntry {
                                path: path.to_string(),
                                mode,
                                holders,
                                owning_workflow_id: workflow_id,
                                acquired_at: Utc::now(),
                                expected_duration_seconds,
                                pid: std::process::id(),
                                priority,
                                acquired_mono: Some(self.clock.now()),
                            },
                        );
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if granted {
            self.persist_debounced()?;
            info!(path, role, ?mode, "lock granted");
        } else {
            info!(path, role, ?mode, "lock denied");
        }
        Ok(granted)
    }

    /// Release `role`'s hold on `path`. No-op (returns `false`) if `role`
    /// does not hold it.
    pub fn release(&self, path: &str, role: &str) -> CoreResult<bool> {
        let released = {
            let mut guard = self.data.lock();
            match guard.file_locks.get_mut(path) {
                Some(entry) if entry.mode == LockMode::Read => {
                    let removed = entry.holders.remove(role);
                    if entry.holders.is_empty() {
                        guard.file_locks.remove(path);
                    }
                    removed
                }
                Some(entry) if entry.holders.contains(role) => {
                    guard.file_locks.remove(path);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.persist_debounced()?;
        }
        Ok(released)
    }

    /// Remove any entry past its TTL (spec §4.5). `only_path` restricts the
    /// sweep to a single entry, used inline by `request`.
    pub fn sweep(&self) -> CoreResult<()> {
        let mut guard = self.data.lock();
        self.sweep_locked(&mut guard, None);
        drop(guard);
        self.persist_debounced()
    }

    fn sweep_locked(&self, guard: &mut LockStoreData, only_path: Option<&str>) {
        let mono_now = self.clock.now();
        // An entry just reloaded from disk has no `acquired_mono` (Instant
        // doesn't survive a restart); anchor it to "now" the first time this
        // sweep sees it rather than treating it as immediately stale.
        for (p, entry) in guard.file_locks.iter_mut() {
            if only_path.map(|op| op == p.as_str()).unwrap_or(true) && entry.acquired_mono.is_none() {
                entry.acquired_mono = Some(mono_now);
            }
        }
        let stale: Vec<String> = guard
            .file_locks
            .iter()
            .filter(|(p, e)| only_path.map(|op| op == p.as_str()).unwrap_or(true) && e.is_stale(mono_now))
            .map(|(p, _)| p.clone())
            .collect();
        for p in stale {
            warn!(path = %p, "stale lock reclaimed");
            guard.file_locks.remove(&p);
        }
    }

    /// Release every entry owned by a completed workflow (spec §4.5).
    pub fn complete_workflow(&self, workflow_id: &Id) -> CoreResult<()> {
        {
            let mut guard = self.data.lock();
            let paths: Vec<String> = guard
                .file_locks
                .iter()
                .filter(|(_, e)| e.owning_workflow_id.as_ref() == Some(workflow_id))
                .map(|(p, _)| p.clone())
                .collect();
            for p in paths {
                guard.file_locks.remove(&p);
            }
            guard.workflows.remove(workflow_id.as_str());
        }
        self.persist_debounced()
    }

    pub fn entry(&self, path: &str) -> Option<FileLockEntry> {
        self.data.lock().file_locks.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().file_locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist_debounced(&self) -> CoreResult<()> {
        let should_write = {
            let mut last = self.last_persist.lock();
            let now = std::time::Instant::now();
            let due = last.map(|t| now.duration_since(t) >= self.debounce).unwrap_or(true);
            if due {
                *last = Some(now);
            }
            due
        };
        if should_write {
            self.persist_now()?;
        }
        Ok(())
    }

    /// Force a write regardless of debounce, used on shutdown.
    pub fn persist_now(&self) -> CoreResult<()> {
        let mut guard = self.data.lock();
        guard.last_updated = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&*guard)?;
        drop(guard);
        sentinel::atomic_write(&self.path, &bytes)
    }
}

fn load_or_init(path: &PathBuf) -> LockStoreData {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "lock registry file corrupt, archiving and resetting");
                let _ = sentinel::archive_corrupt(path);
                LockStoreData::default()
            }
        },
        Err(_) => LockStoreData::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, FileLockRegistry) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locks.json");
        let reg = FileLockRegistry::start(path);
        (dir, reg)
    }

    #[test]
    fn readers_share_a_lock_writer_is_excluded() {
        let (_d, reg) = registry();
        assert!(reg.request("/x", "reader-a", LockMode::Read, 60, None, 0).unwrap());
        assert!(!reg.request("/x", "writer-b", LockMode::Write, 60, None, 0).unwrap());
        assert!(reg.request("/x", "reader-c", LockMode::Read, 60, None, 0).unwrap());

        assert!(reg.release("/x", "reader-a").unwrap());
        assert!(reg.release("/x", "reader-c").unwrap());
        assert!(reg.is_empty());

        assert!(reg.request("/x", "writer-b", LockMode::Write, 60, None, 0).unwrap());
    }

    #[test]
    fn higher_priority_writer_preempts() {
        let (_d, reg) = registry();
        let low_wf = Id::new();
        assert!(reg
            .request("/y", "low-writer", LockMode::Write, 60, Some(low_wf.clone()), 1)
            .unwrap());
        assert!(reg.request("/y", "high-writer", LockMode::Write, 60, None, 10).unwrap());
        let entry = reg.entry("/y").unwrap();
        assert!(entry.holders.contains("high-writer"));
    }

    #[test]
    fn preemption_requires_margin_greater_than_two() {
        let (_d, reg) = registry();
        assert!(reg.request("/z", "low", LockMode::Write, 60, None, 1).unwrap());
        // priority 3 is only +2 over 1, not > +2, so must NOT preempt.
        assert!(!reg.request("/z", "mid", LockMode::Write, 60, None, 3).unwrap());
        assert!(reg.request("/z", "high", LockMode::Write, 60, None, 4).unwrap());
    }

    #[test]
    fn reentrant_write_extends_duration() {
        let (_d, reg) = registry();
        assert!(reg.request("/w", "owner", LockMode::Write, 30, None, 5).unwrap());
        assert!(reg.request("/w", "owner", LockMode::Write, 90, None, 5).unwrap());
        assert_eq!(reg.entry("/w").unwrap().expected_duration_seconds, 90);
    }

    #[test]
    fn zero_expected_duration_defaults_to_sixty() {
        let (_d, reg) = registry();
        reg.request("/d", "owner", LockMode::Write, 0, None, 0).unwrap();
        assert_eq!(reg.entry("/d").unwrap().expected_duration_seconds, 60);
    }

    #[test]
    fn non_owning_release_is_a_noop() {
        let (_d, reg) = registry();
        reg.request("/e", "owner", LockMode::Write, 60, None, 0).unwrap();
        assert!(!reg.release("/e", "someone-else").unwrap());
        assert!(reg.entry("/e").is_some());
    }

    #[test]
    fn complete_workflow_releases_all_its_locks() {
        let (_d, reg) = registry();
        let wf = Id::new();
        reg.request("/a", "r1", LockMode::Write, 60, Some(wf.clone()), 0).unwrap();
        reg.request("/b", "r2", LockMode::Write, 60, Some(wf.clone()), 0).unwrap();
        reg.request("/c", "r3", LockMode::Write, 60, None, 0).unwrap();
        reg.complete_workflow(&wf).unwrap();
        assert!(reg.entry("/a").is_none());
        assert!(reg.entry("/b").is_none());
        assert!(reg.entry("/c").is_some());
    }
}
