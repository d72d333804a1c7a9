//! File lock entry types (spec §3, §4.5).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{Id, MonoInstant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
}

/// Default grace period added to `expected_duration` to compute a lock's TTL.
pub const DEFAULT_GRACE_SECONDS: i64 = 30;
/// `expected_duration == 0` is treated as this default (spec §8 boundary behavior).
pub const DEFAULT_EXPECTED_DURATION_SECONDS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLockEntry {
    pub path: String,
    pub mode: LockMode,
    /// For read mode: every holding role. For write mode: exactly one.
    pub holders: HashSet<String>,
    pub owning_workflow_id: Option<Id>,
    pub acquired_at: DateTime<Utc>,
    pub expected_duration_seconds: i64,
    pub pid: u32,
    /// Priority of the workflow holding/requesting this lock, used for
    /// preemption decisions (spec §4.5).
    pub priority: i64,
    /// Monotonic acquisition instant, used for staleness only (spec §9: TTL
    /// must use monotonic time so a backward wall-clock adjustment can't
    /// misfire the sweep). Not persisted: `Instant` has no meaning across a
    /// process restart, so an entry reloaded from disk starts with `None`
    /// and is re-anchored to "now" on the first sweep that sees it.
    #[serde(skip)]
    pub acquired_mono: Option<MonoInstant>,
}

impl FileLockEntry {
    pub fn ttl_seconds(&self) -> i64 {
        self.expected_duration_seconds + DEFAULT_GRACE_SECONDS
    }

    /// `now` is a monotonic instant; an entry with no recorded
    /// `acquired_mono` yet (just reloaded from disk) is never stale until
    /// the next sweep re-anchors it.
    pub fn is_stale(&self, now: MonoInstant) -> bool {
        self.acquired_mono
            .map(|anchored| now.duration_since(anchored).as_secs() as i64 > self.ttl_seconds())
            .unwrap_or(false)
    }

    pub fn sole_write_holder(&self) -> Option<&String> {
        if self.mode == LockMode::Write {
            self.holders.iter().next()
        } else {
            None
        }
    }
}

pub fn normalize_duration(expected_duration_seconds: i64) -> i64 {
    if expected_duration_seconds <= 0 {
        DEFAULT_EXPECTED_DURATION_SECONDS
    } else {
        expected_duration_seconds
    }
}
