//! Resource snapshot and allocation strategy types (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single metric reading that may be unavailable.
///
/// Downstream consumers treat [`Metric::Unknown`] as worst-case, per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Value(f64),
    Unknown,
}

impl Metric {
    /// Worst-case-safe value for band comparisons: unknown compares as
    /// `f64::INFINITY` so it always trips the highest band.
    pub fn worst_case(&self) -> f64 {
        match self {
            Metric::Value(v) => *v,
            Metric::Unknown => f64::INFINITY,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Metric::Unknown)
    }
}

/// One host resource sample (spec §3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Metric,
    pub mem_percent: Metric,
    pub disk_percent: Metric,
    pub network_bytes: u64,
    pub top_processes: Vec<ProcessRow>,
}

/// Optional top-K process row included in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

/// Bounded ring buffer of retained samples (default capacity 100, spec §3).
#[derive(Debug, Clone)]
pub struct SnapshotRing {
    capacity: usize,
    buf: std::collections::VecDeque<ResourceSnapshot>,
}

impl SnapshotRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buf: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, snapshot: ResourceSnapshot) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<&ResourceSnapshot> {
        self.buf.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceSnapshot> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// The kind of allocation strategy (spec §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ScaleUp,
    Maintain,
    ScaleDown,
    StopNew,
    EmergencyStop,
}

/// The controller's current recommendation (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationStrategy {
    pub kind: StrategyKind,
    pub max_concurrent: usize,
    pub per_type_caps: HashMap<String, usize>,
    pub rationale: String,
    pub issued_at: DateTime<Utc>,
}

impl AllocationStrategy {
    /// The inert starting strategy used before the first controller tick.
    pub fn initial(max_concurrent: usize) -> Self {
        Self {
            kind: StrategyKind::Maintain,
            max_concurrent,
            per_type_caps: HashMap::new(),
            rationale: "initial strategy before first allocation tick".to_string(),
            issued_at: Utc::now(),
        }
    }

    pub fn admits_new_tasks(&self) -> bool {
        !matches!(self.kind, StrategyKind::StopNew | StrategyKind::EmergencyStop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let mut ring = SnapshotRing::new(2);
        for i in 0..3 {
            ring.push(ResourceSnapshot {
                timestamp: Utc::now(),
                cpu_percent: Metric::Value(i as f64),
                mem_percent: Metric::Value(0.0),
                disk_percent: Metric::Value(0.0),
                network_bytes: 0,
                top_processes: vec![],
            });
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.latest().unwrap().cpu_percent, Metric::Value(2.0));
    }

    #[test]
    fn unknown_metric_is_worst_case() {
        assert!(Metric::Unknown.worst_case() > Metric::Value(1e9).worst_case());
    }
}
