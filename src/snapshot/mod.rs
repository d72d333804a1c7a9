//! Snapshot / Recovery (component J, spec §4.10).
//!
//! Periodically snapshots the lock registry, scheduler, workflow store, and
//! session registry (each already persists itself on mutation; this adds a
//! time-based sweep so long periods of no mutation still get a fresh
//! `last_updated` stamp) and, on startup, validates what is on disk before
//! handing control to the rest of the core. Corrupt stores are archived and
//! reset by each owner's own `load_or_init`; this component additionally
//! marks any task left `running` by a prior process as `stopped` with
//! reason "host restart", since in-flight workers cannot be resumed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::SystemExt;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::locks::FileLockRegistry;
use crate::scheduler::Scheduler;
use crate::sentinel;
use crate::session::SessionRegistry;
use crate::workflow::WorkflowStore;

/// Schema version stamped into every top-level state file, checked on load.
pub const SCHEMA_VERSION: u32 = 1;

/// A prior run's record of a task that was `running` when the process
/// exited uncleanly. Written by the Task Manager's own shutdown path when
/// available; read here on startup to reconcile (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrandedTask {
    pub id: String,
    pub task_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StrandedTasksFile {
    schema_version: u32,
    running_at_shutdown: Vec<StrandedTask>,
}

pub struct SnapshotRecovery {
    root: PathBuf,
    locks: Arc<FileLockRegistry>,
    scheduler: Arc<Scheduler>,
    workflow: Arc<WorkflowStore>,
    session: Arc<SessionRegistry>,
}

impl SnapshotRecovery {
    pub fn new(
        root: PathBuf,
        locks: Arc<FileLockRegistry>,
        scheduler: Arc<Scheduler>,
        workflow: Arc<WorkflowStore>,
        session: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            root,
            locks,
            scheduler,
            workflow,
            session,
        }
    }

    fn stranded_path(&self) -> PathBuf {
        self.root.join("running_at_shutdown.json")
    }

    /// Run once at startup, before the rest of the core begins accepting
    /// work: reconcile any tasks recorded as running when the process last
    /// exited.
    pub fn recover_on_startup(&self) -> CoreResult<Vec<StrandedTask>> {
        let path = self.stranded_path();
        let stranded = match sentinel::take_control_object::<StrandedTasksFile>(&path)? {
            Some(file) if file.schema_version == SCHEMA_VERSION => file.running_at_shutdown,
            Some(_) => {
                warn!("stranded-task file schema mismatch, ignoring");
                Vec::new()
            }
            None => Vec::new(),
        };
        for task in &stranded {
            warn!(task_id = %task.id, "marking task stopped: host restart");
        }
        self.workflow.mark_interrupted_by_restart()?;
        Ok(stranded)
    }

    /// One periodic snapshot pass (spec: every 30s and on clean shutdown).
    /// `sys` must have had `refresh_processes` called recently, so the
    /// session sweep's liveness check is meaningful.
    pub fn snapshot_once(&self, sys: &sysinfo::System, running_tasks: Vec<StrandedTask>) -> CoreResult<()> {
        self.locks.persist_now()?;
        self.session.sweep(sys)?;
        let file = StrandedTasksFile {
            schema_version: SCHEMA_VERSION,
            running_at_shutdown: running_tasks,
        };
        sentinel::atomic_write(&self.stranded_path(), &serde_json::to_vec_pretty(&file)?)?;
        info!("snapshot written");
        Ok(())
    }

    /// Periodic snapshot loop; `task_manager_running` supplies the current
    /// running-task ids at each tick and on shutdown, so a crash between
    /// ticks still leaves a reasonably fresh stranded-task record.
    pub async fn run<F>(
        self: Arc<Self>,
        interval: Duration,
        task_manager_running: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn() -> Vec<StrandedTask> + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(interval);
        let mut sys = sysinfo::System::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sys.refresh_processes();
                    if let Err(e) = self.snapshot_once(&sys, task_manager_running()) {
                        warn!(error = %e, "periodic snapshot failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        sys.refresh_processes();
                        if let Err(e) = self.snapshot_once(&sys, task_manager_running()) {
                            warn!(error = %e, "shutdown snapshot failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, TaskManagerConfig};
    use crate::queue::TaskQueue;
    use crate::resource::AllocationController;
    use crate::task::manager::TaskManager;
    use tempfile::tempdir;

    fn recovery() -> (tempfile::TempDir, SnapshotRecovery) {
        let dir = tempdir().unwrap();
        let locks = Arc::new(FileLockRegistry::start(dir.path().join("locks.json")));
        let task_cfg = TaskManagerConfig::default();
        let controller = Arc::new(AllocationController::new(
            &crate::config::ResourceMonitorConfig::default(),
            &task_cfg,
        ));
        let manager = Arc::new(TaskManager::new(task_cfg, Arc::new(TaskQueue::new()), controller));
        let scheduler = Arc::new(Scheduler::start(dir.path().join("schedule.json"), manager));
        let workflow = Arc::new(WorkflowStore::start(dir.path()).unwrap());
        let session = Arc::new(SessionRegistry::start(dir.path().join("sessions.json"), &SessionConfig::default()).unwrap());
        let recovery = SnapshotRecovery::new(dir.path().to_path_buf(), locks, scheduler, workflow, session);
        (dir, recovery)
    }

    #[test]
    fn startup_with_no_prior_file_returns_empty() {
        let (_d, recovery) = recovery();
        let stranded = recovery.recover_on_startup().unwrap();
        assert!(stranded.is_empty());
    }

    #[test]
    fn stranded_tasks_are_recovered_and_file_is_consumed() {
        let (dir, recovery) = recovery();
        let file = StrandedTasksFile {
            schema_version: SCHEMA_VERSION,
            running_at_shutdown: vec![StrandedTask {
                id: "t1".into(),
                task_type: "utility".into(),
            }],
        };
        std::fs::write(dir.path().join("running_at_shutdown.json"), serde_json::to_vec(&file).unwrap()).unwrap();

        let stranded = recovery.recover_on_startup().unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].id, "t1");
        assert!(!dir.path().join("running_at_shutdown.json").exists());
    }

    #[test]
    fn snapshot_once_writes_stranded_file() {
        let (dir, recovery) = recovery();
        let mut sys = sysinfo::System::new();
        sys.refresh_processes();
        recovery
            .snapshot_once(
                &sys,
                vec![StrandedTask {
                    id: "t2".into(),
                    task_type: "analysis".into(),
                }],
            )
            .unwrap();
        assert!(dir.path().join("running_at_shutdown.json").exists());
    }
}
