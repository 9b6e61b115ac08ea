//! Coalescing work queue.
//!
//! Watch events for any number of resources land on a handful of keys. A key that is
//! already waiting is not added twice, and a single worker drains the queue, so at most
//! one cycle runs per key at a time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::controller::request::ObjectKey;

/// Delay before the first retry of a failing key.
const BASE_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound of the per-key retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

struct Inner {
    tx: mpsc::UnboundedSender<ObjectKey>,
    pending: Mutex<HashSet<ObjectKey>>,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

/// Consumer side of the queue.
pub struct WorkQueueReceiver {
    rx: mpsc::UnboundedReceiver<ObjectKey>,
    queue: WorkQueue,
}

/// Create a connected queue and receiver.
pub fn work_queue() -> (WorkQueue, WorkQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = WorkQueue {
        inner: Arc::new(Inner {
            tx,
            pending: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
        }),
    };
    let receiver = WorkQueueReceiver {
        rx,
        queue: queue.clone(),
    };
    (queue, receiver)
}

impl WorkQueue {
    /// Enqueue a key. Returns false if it was already waiting.
    pub fn add(&self, key: ObjectKey) -> bool {
        if !lock(&self.inner.pending).insert(key.clone()) {
            return false;
        }
        if self.inner.tx.send(key.clone()).is_err() {
            lock(&self.inner.pending).remove(&key);
            return false;
        }
        true
    }

    /// Enqueue a key once `delay` has passed.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Record a failure of `key` and return how long to wait before retrying it.
    pub fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut failures = lock(&self.inner.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = BASE_BACKOFF
            .checked_mul(2u32.saturating_pow(*count))
            .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF));
        *count = count.saturating_add(1);
        delay
    }

    /// Reset the failure count of `key` after a successful cycle.
    pub fn forget(&self, key: &ObjectKey) {
        lock(&self.inner.failures).remove(key);
    }

    /// Number of keys waiting.
    pub fn len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkQueueReceiver {
    /// Wait for the next key. Once taken, the key may be enqueued again.
    pub async fn next(&mut self) -> Option<ObjectKey> {
        let key = self.rx.recv().await?;
        lock(&self.queue.inner.pending).remove(&key);
        debug!(key = %key, "Dequeued");
        Some(key)
    }

    /// Producer handle for this receiver.
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }
}
