//! Clock & Identifier Service (component A).
//!
//! Provides the monotonic clock used for all internal scheduling/duration
//! math, the wall clock used for user-visible ISO-8601 timestamps, and a
//! unique id generator. Internal comparisons (deadlines, TTLs) always use
//! [`MonoClock`]; only display/persistence paths touch [`Wall`].

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A monotonic instant, never subject to clock adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonoInstant(Instant);

/// Monotonic clock. Cheap to construct; carries no state of its own beyond
/// the process start epoch, so components share a single instance freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonoClock;

impl MonoClock {
    pub fn now(&self) -> MonoInstant {
        MonoInstant(Instant::now())
    }
}

impl MonoInstant {
    pub fn elapsed(&self) -> std::time::Duration {
        self.0.elapsed()
    }

    pub fn duration_since(&self, earlier: MonoInstant) -> std::time::Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn checked_add(&self, dur: std::time::Duration) -> Option<MonoInstant> {
        self.0.checked_add(dur).map(MonoInstant)
    }

    pub fn is_past(&self, clock: &MonoClock) -> bool {
        clock.now() >= *self
    }
}

/// Wall clock helper producing ISO-8601 UTC timestamps for persistence and
/// display. Never used for internal ordering/deadline math.
pub struct Wall;

impl Wall {
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }
}

/// A globally unique, opaque identifier.
///
/// Combines a random UUIDv4 with, for ids that benefit from being
/// human-legible at a glance (sessions, snapshots), a `host:pid:seq` prefix —
/// mirroring the source's `f"{type}_{int(time.time())}_{os.getpid()}"`
/// session id scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    /// A plain random id, used for tasks/locks/workflows/scheduled entries.
    pub fn new() -> Self {
        Id(Uuid::new_v4().to_string())
    }

    /// A legible id carrying a type tag and the current host/process
    /// identity, used for sessions — the Rust analogue of the source's
    /// `f"{session_type}_{int(time.time())}_{os.getpid()}"` scheme, with a
    /// hostname swapped in for the timestamp (sessions are process-local,
    /// so a per-host disambiguator matters more than when it started) and a
    /// monotonic sequence to break ties within one process.
    pub fn tagged(tag: &str) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        let pid = std::process::id();
        let seq = NEXT_SEQ.next();
        Id(format!("{tag}-{host}-{pid}-{seq}-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local monotonic counter backing [`Id::tagged`].
struct SeqCounter(std::sync::atomic::AtomicU64);
static NEXT_SEQ: SeqCounter = SeqCounter(std::sync::atomic::AtomicU64::new(0));
impl SeqCounter {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn tagged_ids_carry_the_tag() {
        let id = Id::tagged("session");
        assert!(id.as_str().starts_with("session-"));
    }

    #[test]
    fn mono_instant_ordering_is_monotonic() {
        let clock = MonoClock;
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = clock.now();
        assert!(b >= a);
    }
}
