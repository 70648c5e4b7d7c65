//! The FIFO workload queue.
//!
//! Multi-producer (informer callbacks, eviction wakeups), single consumer
//! (the scheduling worker). Entries are deduplicated by job identity, so
//! the queue is bounded by the live-job count.

use std::collections::{HashSet, VecDeque};

use skyshift_types::ObjectRef;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    order: VecDeque<ObjectRef>,
    queued: HashSet<ObjectRef>,
}

#[derive(Default)]
pub struct WorkQueue {
    state: std::sync::Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue::default()
    }

    /// Appends `reference` unless it is already queued.
    pub fn push(&self, reference: ObjectRef) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.queued.insert(reference.clone()) {
            state.order.push_back(reference);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Removes `reference` if it is still queued (e.g. the job was deleted
    /// before its turn).
    pub fn remove(&self, reference: &ObjectRef) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.queued.remove(reference) {
            state.order.retain(|queued| queued != reference);
        }
    }

    /// Waits for and removes the head of the queue.
    pub async fn pop(&self) -> ObjectRef {
        loop {
            {
                let mut state = match self.state.lock() {
                    Ok(state) => state,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(reference) = state.order.pop_front() {
                    state.queued.remove(&reference);
                    return reference;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.order.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
