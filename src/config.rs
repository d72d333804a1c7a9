//! Configuration loading and validation.
//!
//! Layered configuration (defaults → file → environment) backed by the
//! `config` crate, following `knhk-workflow-engine`'s `ConfigLoader`
//! pattern. Fields map onto the semantic config surfaces named in the
//! specification's external-interfaces section (task manager, resource
//! monitor, scheduler).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Root configuration for the composed core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub task_manager: TaskManagerConfig,
    pub resource_monitor: ResourceMonitorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub state_root: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            task_manager: TaskManagerConfig::default(),
            resource_monitor: ResourceMonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
            state_root: "./state/v1".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file, falling back to defaults for unset fields,
    /// then apply environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("AGENTCORE").separator("__"));
        let raw = builder
            .build()
            .map_err(|e| CoreError::Configuration {
                field: "<root>".into(),
                message: e.to_string(),
            })?;
        let mut cfg: CoreConfig = raw.try_deserialize().unwrap_or_default();
        if cfg.task_manager.max_parallel_tasks == 0 {
            cfg.task_manager.max_parallel_tasks = TaskManagerConfig::default().max_parallel_tasks;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.task_manager.validate()?;
        self.resource_monitor.validate()?;
        Ok(())
    }
}

/// `task manager config` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    pub max_parallel_tasks: usize,
    pub resource_thresholds: ResourceThresholds,
    pub task_types: HashMap<String, TaskTypeConfig>,
    pub default_task_type: String,
    pub task_timeout_seconds: u64,
    pub check_peers: bool,
    pub completed_retention: usize,
    pub cancel_grace_seconds: u64,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        let mut task_types = HashMap::new();
        task_types.insert(
            "heavy-render".to_string(),
            TaskTypeConfig {
                max_instances: Some(1),
                cpu_weight: 4.0,
                mem_weight: 3.0,
                disk_weight: 1.0,
            },
        );
        task_types.insert(
            "simulation".to_string(),
            TaskTypeConfig {
                max_instances: None,
                cpu_weight: 3.0,
                mem_weight: 2.5,
                disk_weight: 1.0,
            },
        );
        task_types.insert(
            "analysis".to_string(),
            TaskTypeConfig {
                max_instances: None,
                cpu_weight: 2.0,
                mem_weight: 1.5,
                disk_weight: 1.0,
            },
        );
        task_types.insert(
            "utility".to_string(),
            TaskTypeConfig {
                max_instances: None,
                cpu_weight: 1.0,
                mem_weight: 1.0,
                disk_weight: 1.0,
            },
        );
        Self {
            max_parallel_tasks: 5,
            resource_thresholds: ResourceThresholds::default(),
            task_types,
            default_task_type: "utility".to_string(),
            task_timeout_seconds: 3600,
            check_peers: true,
            completed_retention: 100,
            cancel_grace_seconds: 5,
        }
    }
}

impl TaskManagerConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.default_task_type.is_empty() {
            return Err(CoreError::Configuration {
                field: "task_manager.default_task_type".into(),
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTypeConfig {
    pub max_instances: Option<usize>,
    pub cpu_weight: f64,
    pub mem_weight: f64,
    pub disk_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            mem: 85.0,
            disk: 90.0,
        }
    }
}

/// `resource monitor config` (spec §4.2, §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMonitorConfig {
    pub monitoring_interval_seconds: u64,
    pub allocation_interval_seconds: u64,
    pub max_history: usize,
    pub bands: BandThresholds,
    pub adaptive_allocation: bool,
    pub disk_root: String,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_seconds: 5,
            allocation_interval_seconds: 15,
            max_history: 100,
            bands: BandThresholds::default(),
            adaptive_allocation: true,
            disk_root: "/".to_string(),
        }
    }
}

impl ResourceMonitorConfig {
    fn validate(&self) -> CoreResult<()> {
        self.bands.validate()
    }
}

/// Four-band thresholds per metric, used by the Allocation Controller's
/// decision rule (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            low: 30.0,
            medium: 60.0,
            high: 85.0,
            critical: 95.0,
        }
    }
}

impl BandThresholds {
    fn validate(&self) -> CoreResult<()> {
        if !(self.low < self.medium && self.medium < self.high && self.high < self.critical) {
            return Err(CoreError::Configuration {
                field: "resource_monitor.bands".into(),
                message: "bands must be strictly increasing low < medium < high < critical"
                    .into(),
            });
        }
        Ok(())
    }
}

/// `scheduler config` (spec §6) — entries are loaded separately by the
/// Scheduler's own persistence layer; this only carries the tick cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_seconds: 30 }
    }
}

/// Session registry cadence and arbitration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub monitor_interval_seconds: u64,
    pub stale_after_hours: u64,
    pub arbitration_policy: ArbitrationPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: 30,
            stale_after_hours: 24,
            arbitration_policy: ArbitrationPolicy::Yield,
        }
    }
}

/// What a lower-priority session does when outranked (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationPolicy {
    Ask,
    Yield,
    Continue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_bands_fail_validation() {
        let mut cfg = CoreConfig::default();
        cfg.resource_monitor.bands.high = 10.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = CoreConfig::load("/nonexistent/path/agentcore.json").unwrap();
        assert_eq!(cfg.task_manager.max_parallel_tasks, 5);
    }
}
