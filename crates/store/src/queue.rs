//! Coalescing work queue keyed by object key.
//!
//! A key is queued at most once. A key handed to a worker is not handed to
//! another worker until `done` is called; adds that arrive meanwhile are
//! parked and requeued on `done`. FIFO order, fixed capacity (oldest dropped).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleethub_core::ObjectKey;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Default)]
struct State {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    dropped: u64,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    cap: usize,
}

impl WorkQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), cap: cap.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn add(&self, key: ObjectKey) {
        let mut st = self.lock();
        if st.shutdown || st.queued.contains(&key) {
            return;
        }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        Self::enqueue(&mut st, key, self.cap);
        drop(st);
        self.notify.notify_one();
    }

    fn enqueue(st: &mut State, key: ObjectKey, cap: usize) {
        if st.order.len() >= cap {
            if let Some(old) = st.order.pop_front() {
                st.queued.remove(&old);
                st.dropped += 1;
                metrics::counter!("workqueue_dropped_total", 1u64);
                warn!(key = %old, "work queue full; dropped oldest key");
            }
        }
        st.queued.insert(key.clone());
        st.order.push_back(key);
    }

    /// Requeue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    fn try_pop(&self) -> Option<Option<ObjectKey>> {
        let mut st = self.lock();
        if let Some(key) = st.order.pop_front() {
            st.queued.remove(&key);
            st.processing.insert(key.clone());
            return Some(Some(key));
        }
        if st.shutdown {
            return Some(None);
        }
        None
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(out) = self.try_pop() {
                return out;
            }
            notified.await;
        }
    }

    /// Mark `key` as finished; a key added while it was processing is requeued.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutdown {
            debug!(key = %key, "requeue key changed while processing");
            Self::enqueue(&mut st, key.clone(), self.cap);
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}
