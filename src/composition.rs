//! Composition root (spec §2.1).
//!
//! Owns one instance of every component (A–J) and wires them together.
//! Nothing here reaches for ambient/global state; every cross-component
//! call is an explicit reference the orchestrator handed out. Both the
//! library's integration tests and `main.rs` construct the core through
//! this one entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::ids::{MonoClock, Wall};
use crate::locks::FileLockRegistry;
use crate::notifications::NotificationLog;
use crate::queue::TaskQueue;
use crate::resource::{AllocationController, ResourceSampler};
use crate::scheduler::Scheduler;
use crate::session::SessionRegistry;
use crate::snapshot::{SnapshotRecovery, StrandedTask};
use crate::task::manager::TaskManager;
use crate::workflow::WorkflowStore;

/// Everything the composed core needs to run, built once at startup.
pub struct Orchestrator {
    pub config: CoreConfig,
    pub clock: MonoClock,
    pub sampler: Arc<ResourceSampler>,
    pub controller: Arc<AllocationController>,
    pub session: Arc<SessionRegistry>,
    pub locks: Arc<FileLockRegistry>,
    pub notifications: Arc<NotificationLog>,
    pub queue: Arc<TaskQueue>,
    pub manager: Arc<TaskManager>,
    pub scheduler: Arc<Scheduler>,
    pub workflow: Arc<WorkflowStore>,
    pub snapshot: Arc<SnapshotRecovery>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Build the full component graph. Does not start any background
    /// loops — call [`Orchestrator::run`] for that.
    pub fn build(config: CoreConfig) -> CoreResult<Self> {
        let state_root = PathBuf::from(&config.state_root);
        std::fs::create_dir_all(&state_root)?;

        let sampler = Arc::new(ResourceSampler::new(
            Duration::from_secs(config.resource_monitor.monitoring_interval_seconds),
            config.resource_monitor.disk_root.clone(),
            config.resource_monitor.max_history,
        ));
        let controller = Arc::new(AllocationController::new(&config.resource_monitor, &config.task_manager));

        let session = Arc::new(SessionRegistry::start(state_root.join("sessions.json"), &config.session)?);

        // §9.1 supplemented behavior: a higher-priority peer session active
        // under a `yield` policy drops this process into single-concurrency
        // fallback rather than refusing to start.
        let fallback_single_concurrency = matches!(
            session.arbitrate(),
            crate::session::ArbitrationOutcome::Pause
        );
        if fallback_single_concurrency {
            warn!("higher-priority peer session active; starting in single-concurrency fallback");
            controller.set_concurrency_ceiling(1);
        }

        let locks = Arc::new(FileLockRegistry::start(state_root.join("locks.json")));
        let notifications = Arc::new(NotificationLog::start(state_root.join("gui_notifications.json")));
        let queue = Arc::new(TaskQueue::new());
        let manager = Arc::new(
            TaskManager::new(config.task_manager.clone(), queue.clone(), controller.clone())
                .with_boundary_queue(state_root.join("automation_queue.json"))
                .with_creation_queue(state_root.join("task_creation_queue.json"))
                .with_notifications(notifications.clone()),
        );
        let scheduler = Arc::new(Scheduler::start(state_root.join("schedule.json"), manager.clone()));
        let workflow = Arc::new(WorkflowStore::start(&state_root)?.with_notifications(notifications.clone()));
        let snapshot = Arc::new(SnapshotRecovery::new(
            state_root.clone(),
            locks.clone(),
            scheduler.clone(),
            workflow.clone(),
            session.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            clock: MonoClock,
            sampler,
            controller,
            session,
            locks,
            notifications,
            queue,
            manager,
            scheduler,
            workflow,
            snapshot,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Submit a batch of already-built descriptors atomically (spec §9.1,
    /// `add_batch_tasks`): either all are enqueued or, on an earlier I/O
    /// failure incidental to this call, none are (there is no partial
    /// in-memory queue mutation since `TaskQueue::push` cannot fail).
    pub fn submit_batch(&self, descriptors: Vec<crate::task::descriptor::TaskDescriptor>) {
        for d in descriptors {
            self.manager.submit(d);
        }
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run every background loop until shutdown is signalled. Recovers any
    /// tasks stranded by a prior unclean exit first.
    pub async fn run(self: Arc<Self>) -> CoreResult<()> {
        let stranded = self.snapshot.recover_on_startup()?;
        if !stranded.is_empty() {
            warn!(count = stranded.len(), "reconciled tasks stranded by host restart");
        }

        let sampler_shutdown = self.shutdown_rx.clone();
        let manager_shutdown = self.shutdown_rx.clone();
        let scheduler_shutdown = self.shutdown_rx.clone();
        let snapshot_shutdown = self.shutdown_rx.clone();
        let workflow_shutdown = self.shutdown_rx.clone();

        let sampler = self.sampler.clone();
        let controller = self.controller.clone();
        let mut strategy_feed = sampler.subscribe();

        let sampler_task = tokio::spawn(sampler.clone().run(sampler_shutdown));
        let controller_task = tokio::spawn(async move {
            while strategy_feed.changed().await.is_ok() {
                let snapshot = strategy_feed.borrow().clone();
                controller.evaluate(&snapshot);
            }
        });

        let manager_task = tokio::spawn(
            self.manager
                .clone()
                .run(Duration::from_secs(1), manager_shutdown),
        );
        let scheduler_task = tokio::spawn(
            self.scheduler
                .clone()
                .run(Duration::from_secs(self.config.scheduler.tick_seconds), scheduler_shutdown),
        );
        let workflow_task = tokio::spawn(
            self.workflow
                .clone()
                .run_control_loop(Duration::from_secs(1), workflow_shutdown),
        );

        let manager_for_snapshot = self.manager.clone();
        let snapshot_task = tokio::spawn(self.snapshot.clone().run(
            Duration::from_secs(30),
            move || {
                manager_for_snapshot
                    .running_snapshot()
                    .into_iter()
                    .map(|(id, task_type)| StrandedTask {
                        id: id.as_str().to_string(),
                        task_type,
                    })
                    .collect()
            },
            snapshot_shutdown,
        ));

        info!(state_root = %self.config.state_root, "orchestration core running");

        let _ = tokio::join!(
            sampler_task,
            controller_task,
            manager_task,
            scheduler_task,
            snapshot_task,
            workflow_task
        );
        Ok(())
    }

    pub fn emergency_streak(&self) -> usize {
        self.controller.emergency_streak()
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        Path::new(&self.config.state_root).join(name)
    }

    pub fn wall_now(&self) -> chrono::DateTime<chrono::Utc> {
        Wall::now()
    }
}
