//! Task Queue (component F, spec §4.6).
//!
//! A priority queue keyed by `(priority, submitted_at)` — lower priority
//! number first (spec §3: "lower = earlier"), ties broken FIFO by
//! submission order. Holds no admission policy of its own; the Task Manager
//! decides what is allowed to leave the queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::ids::Id;
use crate::task::descriptor::TaskDescriptor;

struct Entry(TaskDescriptor);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.submitted_at == other.0.submitted_at
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; priority asc (lower number first) means
        // the lower-priority-number entry must compare greater, so reverse
        // the priority comparison. Same for submitted_at: earliest first.
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.submitted_at.cmp(&self.0.submitted_at))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
}

/// Thread-safe priority queue of pending task descriptors.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, descriptor: TaskDescriptor) {
        self.inner.lock().heap.push(Entry(descriptor));
        self.notify.notify_one();
    }

    /// Pop the lowest-priority-number descriptor, if any, without waiting.
    pub fn try_pop(&self) -> Option<TaskDescriptor> {
        self.inner.lock().heap.pop().map(|e| e.0)
    }

    /// Pop the lowest-priority-number descriptor, waiting up to `timeout`
    /// for one to become available.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<TaskDescriptor> {
        if let Some(d) = self.try_pop() {
            return Some(d);
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => self.try_pop(),
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    /// Look at the next descriptor that would be popped, without removing it.
    pub fn peek(&self) -> Option<TaskDescriptor> {
        self.inner.lock().heap.peek().map(|e| e.0.clone())
    }

    /// Remove a queued task by id, e.g. on user-initiated cancel before
    /// dispatch. Returns the removed descriptor, if it was still queued.
    pub fn remove(&self, id: &Id) -> Option<TaskDescriptor> {
        let mut guard = self.inner.lock();
        let items: Vec<TaskDescriptor> = guard.heap.drain().map(|e| e.0).collect();
        let mut removed = None;
        for item in items {
            if removed.is_none() && &item.id == id {
                removed = Some(item);
            } else {
                guard.heap.push(Entry(item));
            }
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// A priority-ordered snapshot, for observability endpoints.
    pub fn snapshot(&self) -> Vec<TaskDescriptor> {
        let guard = self.inner.lock();
        let mut items: Vec<&Entry> = guard.heap.iter().collect();
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|e| e.0.clone()).collect()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::descriptor::TaskKind;

    fn descriptor(priority: i64) -> TaskDescriptor {
        TaskDescriptor::new(
            TaskKind::Command {
                program: "true".into(),
                args: vec![],
            },
            "utility",
            priority,
            0,
        )
    }

    #[test]
    fn lower_priority_number_pops_first() {
        let q = TaskQueue::new();
        q.push(descriptor(1));
        q.push(descriptor(5));
        q.push(descriptor(3));
        assert_eq!(q.try_pop().unwrap().priority, 1);
        assert_eq!(q.try_pop().unwrap().priority, 3);
        assert_eq!(q.try_pop().unwrap().priority, 5);
    }

    /// Spec §8 scenario 1: priorities {5, 3, 7} submitted in that order must
    /// launch in order 3, 5, 7.
    #[test]
    fn scenario_1_launch_order() {
        let q = TaskQueue::new();
        q.push(descriptor(5));
        q.push(descriptor(3));
        q.push(descriptor(7));
        assert_eq!(q.try_pop().unwrap().priority, 3);
        assert_eq!(q.try_pop().unwrap().priority, 5);
        assert_eq!(q.try_pop().unwrap().priority, 7);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let q = TaskQueue::new();
        let a = descriptor(1);
        let a_id = a.id.clone();
        q.push(a);
        std::thread::sleep(Duration::from_millis(2));
        let b = descriptor(1);
        let b_id = b.id.clone();
        q.push(b);

        assert_eq!(q.try_pop().unwrap().id, a_id);
        assert_eq!(q.try_pop().unwrap().id, b_id);
    }

    #[test]
    fn remove_by_id_drops_only_that_entry() {
        let q = TaskQueue::new();
        let keep = descriptor(2);
        let keep_id = keep.id.clone();
        let drop_me = descriptor(4);
        let drop_id = drop_me.id.clone();
        q.push(keep);
        q.push(drop_me);

        let removed = q.remove(&drop_id).unwrap();
        assert_eq!(removed.id, drop_id);
        assert_eq!(q.count(), 1);
        assert_eq!(q.try_pop().unwrap().id, keep_id);
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let q = TaskQueue::new();
        let popped = q.pop_timeout(Duration::from_millis(20)).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_timeout_wakes_on_push() {
        let q = std::sync::Arc::new(TaskQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop_timeout(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(descriptor(9));
        let popped = handle.await.unwrap();
        assert_eq!(popped.unwrap().priority, 9);
    }
}
