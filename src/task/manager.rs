//! Task Manager (component G, dispatcher, spec §4.7).
//!
//! Two loops share one manager: dispatch (admits queued descriptors against
//! the current allocation strategy) and reap (collects finished workers and
//! enforces deadlines). Both run from [`TaskManager::run`], driven by a tick
//! interval, so a single `Arc<TaskManager>` is the only handle callers need.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::descriptor::{RawTaskRequest, TaskDescriptor};
use super::registry::FunctionRegistry;
use super::state::TaskStatus;
use super::worker;
use crate::concurrency::CancelToken;
use crate::config::TaskManagerConfig;
use crate::error::CoreResult;
use crate::ids::{MonoClock, MonoInstant};
use crate::notifications::NotificationLog;
use crate::queue::TaskQueue;
use crate::resource::{AllocationController, AllocationStrategy};
use crate::sentinel;

struct RunningMeta {
    descriptor: TaskDescriptor,
    cancel: CancelToken,
    deadline: Option<MonoInstant>,
    started_at: DateTime<Utc>,
}

/// A terminal record retained for observability (spec §4.7's "last-N completed").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub id: crate::ids::Id,
    pub task_type: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub submitted_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Snapshot returned by [`TaskManager::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub strategy_kind: crate::resource::types::StrategyKind,
    pub max_concurrent: usize,
    pub running_count: usize,
    pub queued_count: usize,
    pub completed: Vec<CompletedRecord>,
    pub queue_snapshot: Vec<TaskDescriptor>,
}

pub struct TaskManager {
    config: TaskManagerConfig,
    queue: Arc<TaskQueue>,
    controller: Arc<AllocationController>,
    running: Mutex<HashMap<crate::ids::Id, RunningMeta>>,
    workers: tokio::sync::Mutex<JoinSet<(crate::ids::Id, TaskDescriptor, worker::WorkerOutcome, bool)>>,
    completed: Mutex<VecDeque<CompletedRecord>>,
    clock: MonoClock,
    emergency: AtomicBool,
    boundary_path: Option<PathBuf>,
    creation_queue_path: Option<PathBuf>,
    notifications: Option<Arc<NotificationLog>>,
    functions: FunctionRegistry,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, queue: Arc<TaskQueue>, controller: Arc<AllocationController>) -> Self {
        Self {
            config,
            queue,
            controller,
            running: Mutex::new(HashMap::new()),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
            completed: Mutex::new(VecDeque::new()),
            clock: MonoClock,
            emergency: AtomicBool::new(false),
            boundary_path: None,
            creation_queue_path: None,
            notifications: None,
            functions: FunctionRegistry::new(),
        }
    }

    /// Attach the `automation_queue` boundary file (spec §6): an append-list
    /// of descriptors external processes (the `agentcore submit` CLI, or any
    /// other collaborator) write, which this manager drains on every tick.
    pub fn with_boundary_queue(mut self, path: PathBuf) -> Self {
        self.boundary_path = Some(path);
        self
    }

    /// Attach the `task_creation_queue` boundary file (spec §6): raw,
    /// unnormalized requests that get normalized into full descriptors and
    /// appended to `automation_queue` on every tick, ahead of
    /// [`Self::drain_boundary_queue`].
    pub fn with_creation_queue(mut self, path: PathBuf) -> Self {
        self.creation_queue_path = Some(path);
        self
    }

    /// Attach the `gui_notifications` event log (spec §6): task completions
    /// are appended to it as they're recorded.
    pub fn with_notifications(mut self, log: Arc<NotificationLog>) -> Self {
        self.notifications = Some(log);
        self
    }

    /// The registry `Function`-kind tasks resolve against. The embedding
    /// application registers implementations before starting the manager's
    /// background loop; a name with nothing registered fails with exit code
    /// 127 rather than panicking.
    pub fn function_registry(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn submit(&self, descriptor: TaskDescriptor) {
        self.queue.push(descriptor);
    }

    /// Append a descriptor to the `automation_queue` boundary file without
    /// going through a running manager's in-process queue at all — the
    /// write side of the same file [`Self::drain_boundary_queue`] reads,
    /// used by out-of-process writers (spec §6).
    pub fn append_to_boundary_file(path: &std::path::Path, descriptor: &TaskDescriptor) -> CoreResult<()> {
        let mut pending: Vec<TaskDescriptor> = match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or_default(),
            _ => Vec::new(),
        };
        pending.push(descriptor.clone());
        sentinel::atomic_write(path, &serde_json::to_vec_pretty(&pending)?)
    }

    /// Drain any descriptors appended to the `automation_queue` boundary
    /// file since the last tick into the in-process queue, then clear it.
    fn drain_boundary_queue(&self) {
        let Some(path) = &self.boundary_path else { return };
        let pending: Vec<TaskDescriptor> = match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "corrupt automation_queue, archiving and resetting");
                    let _ = sentinel::archive_corrupt(path);
                    return;
                }
            },
            _ => return,
        };
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        for descriptor in pending {
            self.queue.push(descriptor);
        }
        if let Err(e) = sentinel::atomic_write(path, b"[]") {
            warn!(error = %e, "failed to clear automation_queue after drain");
        }
        info!(count, "drained automation_queue boundary file");
    }

    /// Normalize anything appended to `task_creation_queue` into full
    /// descriptors and append them to `automation_queue` (spec §6), then
    /// clear the creation queue. A no-op if no `automation_queue` boundary
    /// is attached to drain the normalized result into.
    fn drain_creation_queue(&self) {
        let Some(path) = &self.creation_queue_path else { return };
        let pending: Vec<RawTaskRequest> = match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "corrupt task_creation_queue, archiving and resetting");
                    let _ = sentinel::archive_corrupt(path);
                    return;
                }
            },
            _ => return,
        };
        if pending.is_empty() {
            return;
        }
        let Some(automation_path) = &self.boundary_path else {
            warn!("task_creation_queue has entries but no automation_queue is configured; dropping them");
            let _ = sentinel::atomic_write(path, b"[]");
            return;
        };
        let count = pending.len();
        for raw in pending {
            let descriptor = raw.normalize();
            if let Err(e) = Self::append_to_boundary_file(automation_path, &descriptor) {
                warn!(error = %e, "failed to normalize task_creation_queue entry into automation_queue");
            }
        }
        if let Err(e) = sentinel::atomic_write(path, b"[]") {
            warn!(error = %e, "failed to clear task_creation_queue after normalization");
        }
        info!(count, "normalized task_creation_queue into automation_queue");
    }

    /// Cancel a task wherever it is. Returns `true` if it was found.
    pub fn cancel(&self, id: &crate::ids::Id) -> bool {
        if let Some(meta) = self.running.lock().get(id) {
            meta.cancel.cancel();
            return true;
        }
        if let Some(descriptor) = self.queue.remove(id) {
            self.push_completed(CompletedRecord {
                id: descriptor.id.clone(),
                task_type: descriptor.task_type.clone(),
                status: TaskStatus::Cancelled,
                exit_code: None,
                submitted_at: descriptor.submitted_at,
                ended_at: Utc::now(),
                error: Some("cancelled while queued".to_string()),
            });
            return true;
        }
        false
    }

    pub fn status(&self) -> ManagerStatus {
        let strategy = self.controller.current();
        ManagerStatus {
            strategy_kind: strategy.kind,
            max_concurrent: strategy.max_concurrent,
            running_count: self.running.lock().len(),
            queued_count: self.queue.count(),
            completed: self.completed.lock().iter().cloned().collect(),
            queue_snapshot: self.queue.snapshot(),
        }
    }

    /// Ids and task types of everything currently dispatched, for Snapshot/
    /// Recovery: these, not queued-but-undispatched work, are what a crash
    /// would strand mid-flight.
    pub fn running_snapshot(&self) -> Vec<(crate::ids::Id, String)> {
        self.running
            .lock()
            .values()
            .map(|m| (m.descriptor.id.clone(), m.descriptor.task_type.clone()))
            .collect()
    }

    fn active_count(&self, task_type: &str) -> usize {
        self.running
            .lock()
            .values()
            .filter(|m| m.descriptor.task_type == task_type)
            .count()
    }

    fn push_completed(&self, record: CompletedRecord) {
        if let Some(log) = &self.notifications {
            log.push("task", format!("task {} {:?}", record.id, record.status));
        }
        let mut completed = self.completed.lock();
        completed.push_back(record);
        while completed.len() > self.config.completed_retention {
            completed.pop_front();
        }
    }

    /// One dispatch pass: admit as many queued descriptors as the strategy
    /// allows without starving lower-priority work blocked only by a
    /// per-type cap (spec §4.7 step 4 — deferred entries are re-queued
    /// unchanged at the end of the pass).
    async fn dispatch_tick(&self, strategy: &Arc<AllocationStrategy>) {
        if !strategy.admits_new_tasks() {
            return;
        }
        let mut deferred = Vec::new();
        loop {
            if self.running.lock().len() >= strategy.max_concurrent {
                break;
            }
            let Some(descriptor) = self.queue.try_pop() else {
                break;
            };
            let cap = strategy
                .per_type_caps
                .get(&descriptor.task_type)
                .copied()
                .unwrap_or(usize::MAX);
            if self.active_count(&descriptor.task_type) >= cap {
                deferred.push(descriptor);
                continue;
            }
            self.spawn_worker(descriptor).await;
        }
        for d in deferred {
            self.queue.push(d);
        }
    }

    async fn spawn_worker(&self, descriptor: TaskDescriptor) {
        let cancel = CancelToken::new();
        let deadline = if descriptor.timeout_seconds > 0 {
            self.clock.now().checked_add(Duration::from_secs(descriptor.timeout_seconds))
        } else {
            None
        };
        let id = descriptor.id.clone();
        info!(task_id = %id, task_type = %descriptor.task_type, "dispatching task");
        self.running.lock().insert(
            id.clone(),
            RunningMeta {
                descriptor: descriptor.clone(),
                cancel: cancel.clone(),
                deadline,
                started_at: Utc::now(),
            },
        );

        let grace = Duration::from_secs(self.config.cancel_grace_seconds);
        let kind = descriptor.kind.clone();
        let worker_descriptor = descriptor.clone();
        let worker_id = id.clone();
        let functions = self.functions.clone();
        self.workers.lock().await.spawn(async move {
            let timed_out_signal = cancel.clone();
            let outcome = worker::run(&kind, cancel, grace, &functions).await;
            (worker_id, worker_descriptor, outcome, timed_out_signal.is_cancelled())
        });
    }

    /// Check running tasks against their deadlines, signalling cancel for
    /// anything overdue. Actual reclassification to `TimedOut` happens in
    /// [`Self::reap_tick`] once the worker actually exits.
    fn enforce_deadlines(&self) {
        let now = self.clock.now();
        for meta in self.running.lock().values() {
            if let Some(deadline) = meta.deadline {
                if now >= deadline && !meta.cancel.is_cancelled() {
                    warn!(task_id = %meta.descriptor.id, "deadline exceeded, signalling cancel");
                    meta.cancel.cancel();
                }
            }
        }
    }

    /// Collect any worker that has finished since the last tick.
    async fn reap_tick(&self) {
        loop {
            let next = {
                let mut workers = self.workers.lock().await;
                if workers.is_empty() {
                    None
                } else {
                    workers.try_join_next()
                }
            };
            let Some(joined) = next else { break };
            let Ok((id, descriptor, outcome, was_cancelled)) = joined else {
                continue;
            };
            let meta = self.running.lock().remove(&id);
            let deadline_hit = meta.as_ref().map(|m| m.deadline.map(|d| self.clock.now() >= d).unwrap_or(false)).unwrap_or(false);

            let status = if was_cancelled && deadline_hit {
                TaskStatus::TimedOut
            } else if was_cancelled {
                TaskStatus::Cancelled
            } else if outcome.exit_code == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };

            info!(task_id = %id, ?status, exit_code = outcome.exit_code, "task finished");
            self.push_completed(CompletedRecord {
                id,
                task_type: descriptor.task_type,
                status,
                exit_code: Some(outcome.exit_code),
                submitted_at: descriptor.submitted_at,
                ended_at: Utc::now(),
                error: if outcome.stderr_tail.is_empty() {
                    None
                } else {
                    Some(outcome.stderr_tail)
                },
            });
        }
    }

    /// If the strategy drops into emergency stop, cancel every running task
    /// and refuse new admissions until it recovers (spec §4.7 backpressure).
    fn apply_backpressure(&self, strategy: &Arc<AllocationStrategy>) {
        let now_emergency = matches!(strategy.kind, crate::resource::types::StrategyKind::EmergencyStop);
        let was_emergency = self.emergency.swap(now_emergency, Ordering::Relaxed);
        if now_emergency && !was_emergency {
            warn!("emergency stop: cancelling all running tasks");
            for meta in self.running.lock().values() {
                meta.cancel.cancel();
            }
        }
    }

    /// Drive dispatch + reap + deadline enforcement until `shutdown` fires.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_creation_queue();
                    self.drain_boundary_queue();
                    let strategy = self.controller.current();
                    self.apply_backpressure(&strategy);
                    self.enforce_deadlines();
                    self.reap_tick().await;
                    self.dispatch_tick(&strategy).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
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
    use crate::config::{ResourceMonitorConfig, TaskManagerConfig};
    use crate::task::descriptor::TaskKind;

    fn manager() -> TaskManager {
        let task_cfg = TaskManagerConfig::default();
        let controller = Arc::new(AllocationController::new(&ResourceMonitorConfig::default(), &task_cfg));
        TaskManager::new(task_cfg, Arc::new(TaskQueue::new()), controller)
    }

    fn descriptor(task_type: &str, priority: i64) -> TaskDescriptor {
        TaskDescriptor::new(
            TaskKind::Command {
                program: "true".into(),
                args: vec![],
            },
            task_type,
            priority,
            0,
        )
    }

    #[tokio::test]
    async fn dispatch_runs_a_task_and_reap_records_it() {
        let mgr = manager();
        mgr.submit(descriptor("utility", 1));
        let strategy = mgr.controller.current();
        mgr.dispatch_tick(&strategy).await;
        assert_eq!(mgr.status().running_count, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        mgr.reap_tick().await;
        let status = mgr.status();
        assert_eq!(status.running_count, 0);
        assert_eq!(status.completed.len(), 1);
        assert_eq!(status.completed[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_removes_queued_task_and_records_it() {
        let mgr = manager();
        let d = descriptor("utility", 1);
        let id = d.id.clone();
        mgr.submit(d);
        assert!(mgr.cancel(&id));
        assert_eq!(mgr.status().queued_count, 0);
        assert_eq!(mgr.status().completed[0].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn emergency_stop_cancels_running_tasks() {
        let mgr = manager();
        mgr.submit(descriptor("utility", 1));
        let strategy = mgr.controller.current();
        mgr.dispatch_tick(&strategy).await;

        let emergency = Arc::new(AllocationStrategy {
            kind: crate::resource::types::StrategyKind::EmergencyStop,
            max_concurrent: 0,
            per_type_caps: HashMap::new(),
            rationale: "test".into(),
            issued_at: Utc::now(),
        });
        mgr.apply_backpressure(&emergency);
        let cancelled = mgr.running.lock().values().all(|m| m.cancel.is_cancelled());
        assert!(cancelled);
    }

    #[tokio::test]
    async fn boundary_queue_drains_appended_descriptors_into_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("automation_queue.json");
        let mgr = manager().with_boundary_queue(path.clone());

        TaskManager::append_to_boundary_file(&path, &descriptor("utility", 1)).unwrap();
        TaskManager::append_to_boundary_file(&path, &descriptor("utility", 2)).unwrap();

        mgr.drain_boundary_queue();
        assert_eq!(mgr.status().queued_count, 2);

        let remaining: Vec<TaskDescriptor> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn creation_queue_normalizes_into_automation_queue() {
        let dir = tempfile::tempdir().unwrap();
        let creation_path = dir.path().join("task_creation_queue.json");
        let automation_path = dir.path().join("automation_queue.json");
        let mgr = manager()
            .with_creation_queue(creation_path.clone())
            .with_boundary_queue(automation_path.clone());

        let raw = crate::task::descriptor::RawTaskRequest {
            kind: TaskKind::Command {
                program: "true".into(),
                args: vec![],
            },
            task_type: "utility".into(),
            priority: 3,
            timeout_seconds: 0,
            requirements: Default::default(),
        };
        sentinel::atomic_write(&creation_path, &serde_json::to_vec(&vec![raw]).unwrap()).unwrap();

        mgr.drain_creation_queue();
        let normalized: Vec<TaskDescriptor> = serde_json::from_slice(&std::fs::read(&automation_path).unwrap()).unwrap();
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].priority, 3);

        let remaining: Vec<RawTaskRequest> = serde_json::from_slice(&std::fs::read(&creation_path).unwrap()).unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn per_type_cap_defers_without_dropping() {
        let mgr = manager();
        mgr.submit(descriptor("heavy-render", 1));
        mgr.submit(descriptor("heavy-render", 1));
        let mut strategy = (*mgr.controller.current()).clone();
        strategy.max_concurrent = 5;
        strategy.per_type_caps.insert("heavy-render".to_string(), 1);
        let strategy = Arc::new(strategy);

        mgr.dispatch_tick(&strategy).await;
        assert_eq!(mgr.status().running_count, 1);
        assert_eq!(mgr.status().queued_count, 1);
    }
}
