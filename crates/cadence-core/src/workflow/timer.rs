//! Time-ordered wake queue for delay nodes.
//!
//! A min-heap keyed by resume timestamp. The timer loop pops due entries;
//! each entry carries the instance epoch at which the wait began so a wake
//! for a cancelled or already-resumed instance is recognised as stale.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

/// A scheduled resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Wake {
    pub resume_at: DateTime<Utc>,
    pub instance_id: Uuid,
    pub epoch: u64,
}

/// Shared min-heap of pending wakes.
#[derive(Debug, Default)]
pub struct WakeQueue {
    heap: Mutex<BinaryHeap<Reverse<Wake>>>,
    notify: Notify,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a wake. Duplicate entries are tolerated; the engine drops
    /// all but the first by epoch check.
    pub fn schedule(&self, wake: Wake) {
        self.lock().push(Reverse(wake));
        self.notify.notify_one();
        tracing::debug!(
            instance_id = %wake.instance_id,
            epoch = wake.epoch,
            resume_at = %wake.resume_at,
            "wake scheduled"
        );
    }

    /// Remove and return every wake due at or before `now`, earliest first.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<Wake> {
        let mut heap = self.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(w)| w.resume_at <= now) {
            if let Some(Reverse(wake)) = heap.pop() {
                due.push(wake);
            }
        }
        due
    }

    /// Earliest scheduled resume time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().peek().map(|Reverse(w)| w.resume_at)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when a new wake is scheduled.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<Wake>>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }
}
