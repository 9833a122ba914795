//! Worker pool driving the cluster-set controller from the work queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleethub_core::{ClusterSet, EventRecorder, Member, Object, ObjectKey, ObjectStore, WatchEvent};
use fleethub_store::WorkQueue;
use futures::future::join_all;
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::clusterset::{ClusterSetController, SyncContext};
use crate::config::HubConfig;

pub struct Runner<S, R> {
    controller: Arc<ClusterSetController<S, R>>,
    queue: Arc<WorkQueue>,
    cfg: HubConfig,
    failures: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl<S, R> Runner<S, R>
where
    S: ObjectStore + 'static,
    R: EventRecorder + 'static,
{
    pub fn new(controller: Arc<ClusterSetController<S, R>>, queue: Arc<WorkQueue>, cfg: HubConfig) -> Self {
        Self { controller, queue, cfg, failures: Mutex::new(FxHashMap::default()) }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn on_member_event(&self, event: &WatchEvent<Member>) {
        for key in self.controller.sets_for_member_event(event) {
            self.queue.add(key);
        }
    }

    pub fn on_set_event(&self, event: &WatchEvent<ClusterSet>) {
        match event {
            WatchEvent::Applied(set) => self.queue.add(set.key()),
            WatchEvent::Deleted(set) => debug!(set = %set.key(), "cluster set deleted"),
        }
    }

    /// Exponential per-key requeue delay: `requeue_base * 2^failures`, capped.
    fn requeue_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = (*n).min(30);
        *n += 1;
        self.cfg.requeue_base.saturating_mul(1u32 << exp).min(self.cfg.requeue_max)
    }

    fn forget_failures(&self, key: &ObjectKey) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    /// Process one key. Returns `false` once the queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.next().await else {
            return false;
        };
        let ctx = match self.cfg.sync_timeout {
            Some(t) => SyncContext::with_timeout(t),
            None => SyncContext::new(),
        };
        match self.controller.sync(&ctx, &key).await {
            Ok(()) => self.forget_failures(&key),
            Err(e) if e.is_retryable() => {
                let delay = self.requeue_delay(&key);
                counter!("clusterset_requeue_total", 1u64);
                warn!(set = %key, error = %e, delay_ms = delay.as_millis() as u64, "sync failed; requeueing");
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                self.forget_failures(&key);
                error!(set = %key, error = %e, "sync failed; not retrying");
            }
        }
        self.queue.done(&key);
        true
    }

    /// Enqueue every cluster set in the store.
    pub async fn resync(&self) {
        match self.controller.all_sets().await {
            Ok(keys) => {
                debug!(count = keys.len(), "resync");
                for key in keys {
                    self.queue.add(key);
                }
            }
            Err(e) => warn!(error = %e, "resync list failed"),
        }
    }

    /// Run the workers (and the periodic resync) until the queue shuts down.
    pub async fn run(self: Arc<Self>) {
        info!(workers = self.cfg.workers, "cluster set workers starting");
        self.resync().await;

        let resync = self.cfg.resync_interval.map(|every| {
            let me = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    me.resync().await;
                }
            })
        });

        let workers = (0..self.cfg.workers.max(1)).map(|_| {
            let me = Arc::clone(&self);
            tokio::spawn(async move { while me.process_next().await {} })
        });
        for res in join_all(workers).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        if let Some(h) = resync {
            h.abort();
        }
        info!("cluster set workers stopped");
    }
}
