//! Bounded live-delivery queue between a run's worker and its consumers.
//!
//! Pushes never block: when the queue is full the oldest pending item is
//! evicted (most recent wins). Closing enqueues [`StreamItem::End`], which
//! consumers treat as authoritative end-of-stream; once drained, every
//! further pull returns `End` again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamItem {
    Epoch(Value),
    End,
}

impl StreamItem {
    pub fn is_end(&self) -> bool {
        matches!(self, StreamItem::End)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<StreamItem>,
    closed: bool,
}

#[derive(Debug)]
pub struct DeliveryQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Notify,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closed and read through to the end sentinel.
    pub fn is_drained(&self) -> bool {
        let state = self.state();
        state.closed && state.items.is_empty()
    }

    /// Enqueue one epoch. Returns `true` if an older item was evicted to make
    /// room. Pushes after `close` are discarded.
    pub fn push(&self, metrics: Value) -> bool {
        let evicted = {
            let mut state = self.state();
            if state.closed {
                return false;
            }
            self.admit(&mut state, StreamItem::Epoch(metrics))
        };
        self.ready.notify_one();
        evicted
    }

    /// Enqueue the end-of-stream sentinel. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            self.admit(&mut state, StreamItem::End);
        }
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    fn admit(&self, state: &mut QueueState, item: StreamItem) -> bool {
        let mut evicted = false;
        while state.items.len() >= self.capacity {
            state.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            evicted = true;
        }
        state.items.push_back(item);
        evicted
    }

    /// Take the next item without waiting.
    pub fn try_pull(&self) -> Option<StreamItem> {
        let mut state = self.state();
        match state.items.pop_front() {
            Some(item) => Some(item),
            None if state.closed => Some(StreamItem::End),
            None => None,
        }
    }

    /// Wait up to `timeout` for the next item; `None` on timeout.
    pub async fn pull(&self, timeout: Duration) -> Option<StreamItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if let Some(item) = self.try_pull() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pull();
            }
        }
    }
}
