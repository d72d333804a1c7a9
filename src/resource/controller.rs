//! Allocation Controller (component C, spec §4.3).
//!
//! Turns resource snapshots into an [`AllocationStrategy`] on its own tick.
//! The decision rule is evaluated in order (first match wins): critical →
//! emergency_stop, high → scale_down, medium → maintain, else scale_up.
//! Adaptive clamping bounds how far `max_concurrent` can move from the
//! previous strategy in one tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use super::types::{AllocationStrategy, Metric, ResourceSnapshot, StrategyKind};
use crate::config::{BandThresholds, ResourceMonitorConfig, TaskManagerConfig};
use crate::ids::Wall;

/// Which band a metric currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Band {
    Low,
    Medium,
    High,
    Critical,
}

fn band_of(value: f64, bands: &BandThresholds) -> Band {
    if value >= bands.critical {
        Band::Critical
    } else if value >= bands.high {
        Band::High
    } else if value >= bands.medium {
        Band::Medium
    } else {
        Band::Low
    }
}

/// The Allocation Controller. Holds the current strategy behind a swappable
/// `Arc` so admission decisions in the Task Manager never block on the
/// controller's own tick.
pub struct AllocationController {
    bands: BandThresholds,
    task_types: Arc<RwLock<HashMap<String, crate::config::TaskTypeConfig>>>,
    adaptive: bool,
    current: Arc<RwLock<Arc<AllocationStrategy>>>,
    tx: watch::Sender<Arc<AllocationStrategy>>,
    emergency_streak: AtomicUsize,
    /// Hard ceiling on `max_concurrent`, independent of the band-derived
    /// value. Used for the single-concurrency fallback (spec §9.1,
    /// `check_peers`) when a higher-priority peer session is active.
    concurrency_ceiling: AtomicUsize,
}

impl AllocationController {
    pub fn new(resource_cfg: &ResourceMonitorConfig, task_cfg: &TaskManagerConfig) -> Self {
        let initial = Arc::new(AllocationStrategy::initial(task_cfg.max_parallel_tasks));
        let (tx, _rx) = watch::channel(initial.clone());
        Self {
            bands: resource_cfg.bands.clone(),
            task_types: Arc::new(RwLock::new(task_cfg.task_types.clone())),
            adaptive: resource_cfg.adaptive_allocation,
            current: Arc::new(RwLock::new(initial)),
            tx,
            emergency_streak: AtomicUsize::new(0),
            concurrency_ceiling: AtomicUsize::new(usize::MAX),
        }
    }

    /// Read the current strategy without blocking the controller.
    pub fn current(&self) -> Arc<AllocationStrategy> {
        self.current.read().clone()
    }

    /// Cap every future strategy's `max_concurrent` at `ceiling`, regardless
    /// of what the band-derived value would otherwise be. Set once at
    /// startup for the single-concurrency peer-session fallback; `usize::MAX`
    /// disables the ceiling.
    pub fn set_concurrency_ceiling(&self, ceiling: usize) {
        self.concurrency_ceiling.store(ceiling, Ordering::Relaxed);
        let mut current = self.current.write();
        if current.max_concurrent > ceiling {
            let mut clamped = (**current).clone();
            clamped.max_concurrent = ceiling;
            clamped.per_type_caps = self.derive_type_caps(ceiling);
            *current = Arc::new(clamped);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<AllocationStrategy>> {
        self.tx.subscribe()
    }

    /// Number of consecutive emergency-stop strategies issued back to back;
    /// used by the composition root to detect the "fatal host condition"
    /// in spec §7.
    pub fn emergency_streak(&self) -> usize {
        self.emergency_streak.load(Ordering::Relaxed)
    }

    /// Evaluate one snapshot and publish a new strategy.
    pub fn evaluate(&self, snapshot: &ResourceSnapshot) -> Arc<AllocationStrategy> {
        let prev = self.current();
        let cpu = snapshot.cpu_percent.worst_case();
        let mem = snapshot.mem_percent.worst_case();
        let disk = snapshot.disk_percent.worst_case();

        let worst_band = [cpu, mem, disk]
            .iter()
            .map(|v| band_of(*v, &self.bands))
            .max()
            .unwrap_or(Band::Low);

        let (kind, base) = match worst_band {
            Band::Critical => (StrategyKind::EmergencyStop, 0),
            Band::High => {
                // "if usage just above high, allow 3" — treat the bottom
                // third of [high, critical) as "just above".
                let span = (self.bands.critical - self.bands.high).max(1.0);
                let worst = [cpu, mem, disk].iter().cloned().fold(0.0_f64, f64::max);
                let frac = ((worst - self.bands.high) / span).clamp(0.0, 1.0);
                (StrategyKind::ScaleDown, if frac < 0.33 { 3 } else { 2 })
            }
            Band::Medium => {
                let span = (self.bands.high - self.bands.medium).max(1.0);
                let worst = [cpu, mem, disk].iter().cloned().fold(0.0_f64, f64::max);
                let frac = ((worst - self.bands.medium) / span).clamp(0.0, 1.0);
                // Base 5, nudged down as the most constrained metric
                // approaches `high`.
                let base = 5.0 - frac * 2.0;
                (StrategyKind::Maintain, base.round() as i64)
            }
            Band::Low => {
                let half_low = self.bands.low / 2.0;
                let all_very_low = [cpu, mem, disk].iter().all(|v| *v <= half_low);
                (StrategyKind::ScaleUp, if all_very_low { 10 } else { 8 })
            }
        };

        let max_concurrent = if self.adaptive {
            clamp_adaptive(prev.max_concurrent as i64, base, &kind)
        } else {
            base.max(0)
        } as usize;
        let max_concurrent = max_concurrent.min(self.concurrency_ceiling.load(Ordering::Relaxed));

        let per_type_caps = self.derive_type_caps(max_concurrent);

        let rationale = format!(
            "cpu={cpu:.1} mem={mem:.1} disk={disk:.1} band={worst_band:?} -> {kind:?} max={max_concurrent}"
        );

        if matches!(kind, StrategyKind::EmergencyStop) {
            self.emergency_streak.fetch_add(1, Ordering::Relaxed);
        } else {
            self.emergency_streak.store(0, Ordering::Relaxed);
        }

        let strategy = Arc::new(AllocationStrategy {
            kind,
            max_concurrent,
            per_type_caps,
            rationale,
            issued_at: Wall::now(),
        });

        info!(strategy = ?strategy.kind, max = strategy.max_concurrent, "allocation strategy issued");
        *self.current.write() = strategy.clone();
        let _ = self.tx.send(strategy.clone());
        strategy
    }

    fn derive_type_caps(&self, max_concurrent: usize) -> HashMap<String, usize> {
        let types = self.task_types.read();
        if types.is_empty() || max_concurrent == 0 {
            return types
                .keys()
                .map(|k| (k.clone(), 0))
                .collect();
        }
        let avg_weight: f64 = types.values().map(|t| t.cpu_weight).sum::<f64>() / types.len() as f64;
        types
            .iter()
            .map(|(name, cfg)| {
                let cap = if name == "heavy-render" {
                    ((max_concurrent as f64 / 4.0).round() as usize).max(1)
                } else {
                    let w = if cfg.cpu_weight > 0.0 { cfg.cpu_weight } else { avg_weight.max(1.0) };
                    ((max_concurrent as f64 / w).round() as usize).max(1)
                };
                (name.clone(), cap.min(max_concurrent.max(1)))
            })
            .collect()
    }
}

/// Bound how far `base` may move from `prev` in one tick, per strategy kind.
fn clamp_adaptive(prev: i64, base: i64, kind: &StrategyKind) -> i64 {
    match kind {
        StrategyKind::EmergencyStop => 0,
        StrategyKind::ScaleDown => base.max(prev - 1),
        StrategyKind::Maintain => base.clamp(prev - 1, prev + 1),
        StrategyKind::ScaleUp => base.min(prev + 2),
        StrategyKind::StopNew => 0,
    }
    .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::types::Metric;

    fn snapshot(cpu: f64, mem: f64, disk: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            timestamp: Wall::now(),
            cpu_percent: Metric::Value(cpu),
            mem_percent: Metric::Value(mem),
            disk_percent: Metric::Value(disk),
            network_bytes: 0,
            top_processes: vec![],
        }
    }

    #[test]
    fn critical_cpu_triggers_emergency_stop() {
        let controller =
            AllocationController::new(&ResourceMonitorConfig::default(), &TaskManagerConfig::default());
        let s = controller.evaluate(&snapshot(96.0, 10.0, 10.0));
        assert_eq!(s.kind, StrategyKind::EmergencyStop);
        assert_eq!(s.max_concurrent, 0);
    }

    #[test]
    fn low_usage_scales_up() {
        let controller =
            AllocationController::new(&ResourceMonitorConfig::default(), &TaskManagerConfig::default());
        let s = controller.evaluate(&snapshot(5.0, 5.0, 5.0));
        assert_eq!(s.kind, StrategyKind::ScaleUp);
        assert!(s.max_concurrent >= 8);
    }

    #[test]
    fn scale_down_never_drops_more_than_one_from_previous() {
        let controller =
            AllocationController::new(&ResourceMonitorConfig::default(), &TaskManagerConfig::default());
        // First push max_concurrent up via scale_up.
        controller.evaluate(&snapshot(5.0, 5.0, 5.0));
        let prev = controller.current().max_concurrent;
        let s = controller.evaluate(&snapshot(90.0, 10.0, 10.0));
        assert!(s.max_concurrent as i64 >= prev as i64 - 1);
    }

    #[test]
    fn heavy_render_cap_is_quarter_of_max_concurrent() {
        let controller =
            AllocationController::new(&ResourceMonitorConfig::default(), &TaskManagerConfig::default());
        let s = controller.evaluate(&snapshot(5.0, 5.0, 5.0));
        let cap = s.per_type_caps.get("heavy-render").copied().unwrap();
        assert_eq!(cap, ((s.max_concurrent as f64 / 4.0).round() as usize).max(1));
    }

    #[test]
    fn concurrency_ceiling_caps_future_and_current_strategy() {
        let controller =
            AllocationController::new(&ResourceMonitorConfig::default(), &TaskManagerConfig::default());
        controller.set_concurrency_ceiling(1);
        assert_eq!(controller.current().max_concurrent, 1);
        let s = controller.evaluate(&snapshot(5.0, 5.0, 5.0));
        assert_eq!(s.max_concurrent, 1);
    }

    #[test]
    fn recovering_from_emergency_resumes_scale_down_then_up() {
        let controller =
            AllocationController::new(&ResourceMonitorConfig::default(), &TaskManagerConfig::default());
        let s1 = controller.evaluate(&snapshot(96.0, 10.0, 10.0));
        assert_eq!(s1.kind, StrategyKind::EmergencyStop);
        assert_eq!(controller.emergency_streak(), 1);
        let s2 = controller.evaluate(&snapshot(70.0, 20.0, 20.0));
        assert_eq!(s2.kind, StrategyKind::ScaleDown);
        assert_eq!(controller.emergency_streak(), 0);
    }
}
