//! Shoal work queue: FIFO of pending items with in-flight tracking.
//!
//! Every item is in one of three states: absent, queued, or in flight (handed
//! out by [`WorkQueue::get`] and not yet [`WorkQueue::done`]). Adding an item
//! that is in flight marks it dirty instead of queueing a second copy; `done`
//! puts a dirty item back exactly once. Two consumers therefore never hold the
//! same item at the same time, and no add is lost.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    InFlight { dirty: bool },
}

struct State<T> {
    order: VecDeque<T>,
    slots: FxHashMap<T, Slot>,
    shutting_down: bool,
}

/// Concurrency-safe, shutdown-aware work queue.
pub struct WorkQueue<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Eq + Hash + Clone> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> WorkQueue<T> {
    pub fn new() -> Self {
        Self::named("default")
    }

    /// Queue with a name used to label its metrics and logs.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State { order: VecDeque::new(), slots: FxHashMap::default(), shutting_down: false }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` unless it is already pending. In-flight items are marked
    /// dirty and come back once after `done`. Inert after `shut_down`.
    pub fn add(&self, item: T) {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.shutting_down {
            debug!(queue = %self.name, "add after shutdown ignored");
            return;
        }
        if let Some(slot) = st.slots.get_mut(&item) {
            if let Slot::InFlight { dirty } = slot {
                *dirty = true;
            }
            return;
        }
        st.slots.insert(item.clone(), Slot::Queued);
        st.order.push_back(item);
        let depth = st.order.len();
        drop(guard);
        counter!("workqueue_adds_total", 1u64, "queue" => self.name.clone());
        gauge!("workqueue_depth", depth as f64, "queue" => self.name.clone());
        self.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down and
    /// drained; that is the only termination signal.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.lock();
                let st = &mut *guard;
                if let Some(item) = st.order.pop_front() {
                    st.slots.insert(item.clone(), Slot::InFlight { dirty: false });
                    let depth = st.order.len();
                    drop(guard);
                    gauge!("workqueue_depth", depth as f64, "queue" => self.name.clone());
                    if depth > 0 {
                        // pass the wakeup on; we may have consumed the only permit
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as processed. A dirty item is queued again.
    ///
    /// Calling this for an item that was not handed out by [`get`](Self::get)
    /// is a programming error with unspecified results; it is logged, and
    /// debug builds assert.
    pub fn done(&self, item: &T) {
        let mut guard = self.lock();
        let st = &mut *guard;
        match st.slots.remove(item) {
            Some(Slot::InFlight { dirty: false }) => {}
            Some(Slot::InFlight { dirty: true }) => {
                st.slots.insert(item.clone(), Slot::Queued);
                st.order.push_back(item.clone());
                drop(guard);
                self.notify.notify_one();
            }
            Some(Slot::Queued) => {
                st.slots.insert(item.clone(), Slot::Queued);
                drop(guard);
                warn!(queue = %self.name, "done called for an item that is queued, not in flight");
                debug_assert!(false, "WorkQueue::done on a queued item");
            }
            None => {
                drop(guard);
                warn!(queue = %self.name, "done called for an unknown item");
                debug_assert!(false, "WorkQueue::done without a matching get");
            }
        }
    }

    /// Stop accepting work. Queued items still drain; idle consumers wake up
    /// and see `None` once the queue is empty. Idempotent.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let remaining = st.order.len();
        drop(st);
        debug!(queue = %self.name, remaining, "work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Items waiting to be handed out (in-flight items are not counted).
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently handed out and not yet done.
    pub fn in_flight(&self) -> usize {
        self.lock().slots.values().filter(|s| matches!(s, Slot::InFlight { .. })).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_and_dedup_while_queued() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert_eq!(q.in_flight(), 2);
        q.done(&"a");
        q.done(&"b");
        assert_eq!(q.in_flight(), 0);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn dirty_item_redelivered_once() {
        let q = WorkQueue::new();
        q.add(1u32);
        let item = q.get().await.unwrap();
        q.add(1);
        q.add(1);
        // in flight: not visible to other consumers yet
        assert_eq!(q.len(), 0);
        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(1));
        q.done(&1);
        q.shut_down();
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn add_after_shutdown_is_inert() {
        let q = WorkQueue::new();
        q.add("x");
        q.shut_down();
        q.shut_down();
        q.add("y");
        assert!(q.is_shutting_down());
        assert_eq!(q.get().await, Some("x"));
        q.done(&"x");
        assert_eq!(q.get().await, None);
    }
}
