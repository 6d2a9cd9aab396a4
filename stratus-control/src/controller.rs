//! Controllers: a reconciler plus the watches that feed its work queue.

use std::sync::Arc;

use async_trait::async_trait;
use stratus_api::{IpRange, NfsInstance, RecordStore, Resource, StoreEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::composed::Flow;
use crate::error::Result;
use crate::manager::WorkQueue;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Run one pass for the record named `key`.
    async fn reconcile(&self, key: &str) -> Result<Flow>;
}

/// Maps store events to record keys of one controller.
#[async_trait]
pub trait WatchSource: Send + Sync {
    fn name(&self) -> &str;

    fn subscribe(&self) -> Result<broadcast::Receiver<StoreEvent>>;

    /// Keys enqueued when the controller starts and after a lagged watch.
    async fn initial_keys(&self) -> Result<Vec<String>>;

    async fn map(&self, event: &StoreEvent) -> Vec<String>;
}

/// Watches the controller's own kind; every event enqueues the record itself.
pub struct RecordWatch<R: Resource> {
    store: Arc<dyn RecordStore<R>>,
}

impl<R: Resource> RecordWatch<R> {
    pub fn new(store: Arc<dyn RecordStore<R>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<R: Resource> WatchSource for RecordWatch<R> {
    fn name(&self) -> &str {
        R::KIND
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<StoreEvent>> {
        Ok(self.store.subscribe()?)
    }

    async fn initial_keys(&self) -> Result<Vec<String>> {
        let records = self.store.list().await?;
        Ok(records.iter().map(|r| r.name().to_string()).collect())
    }

    async fn map(&self, event: &StoreEvent) -> Vec<String> {
        if event.resource_type != R::KIND {
            return Vec::new();
        }
        vec![event.name.clone()]
    }
}

/// IpRange changes enqueue every NfsInstance that names the IpRange.
pub struct IpRangeReferenceWatch {
    ip_ranges: Arc<dyn RecordStore<IpRange>>,
    nfs_instances: Arc<dyn RecordStore<NfsInstance>>,
}

impl IpRangeReferenceWatch {
    pub fn new(
        ip_ranges: Arc<dyn RecordStore<IpRange>>,
        nfs_instances: Arc<dyn RecordStore<NfsInstance>>,
    ) -> Self {
        Self {
            ip_ranges,
            nfs_instances,
        }
    }
}

#[async_trait]
impl WatchSource for IpRangeReferenceWatch {
    fn name(&self) -> &str {
        "IpRange->NfsInstance"
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<StoreEvent>> {
        Ok(self.ip_ranges.subscribe()?)
    }

    async fn initial_keys(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn map(&self, event: &StoreEvent) -> Vec<String> {
        match self.nfs_instances.list().await {
            Ok(instances) => instances
                .into_iter()
                .filter(|i| i.spec.ip_range == event.name)
                .map(|i| i.meta.name)
                .collect(),
            Err(e) => {
                warn!("Failed to list NfsInstances for IpRange {}: {}", event.name, e);
                Vec::new()
            }
        }
    }
}

struct RegisteredWatch {
    source: Box<dyn WatchSource>,
    events: broadcast::Receiver<StoreEvent>,
}

/// One reconciler, its queue and its subscribed watches.
pub struct Controller {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    watches: Vec<RegisteredWatch>,
    queue: Arc<WorkQueue>,
    workers: usize,
}

impl Controller {
    pub fn new(name: impl Into<String>, reconciler: Arc<dyn Reconciler>, workers: usize) -> Self {
        Self {
            name: name.into(),
            reconciler,
            watches: Vec::new(),
            queue: Arc::new(WorkQueue::new()),
            workers: workers.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to `source`. Events published after this call are not lost.
    pub fn watch(&mut self, source: Box<dyn WatchSource>) -> Result<()> {
        let events = source.subscribe()?;
        debug!("Controller {} watching {}", self.name, source.name());
        self.watches.push(RegisteredWatch { source, events });
        Ok(())
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Spawn the delayed-queue pump, one task per watch and the reconcile workers.
    pub fn start(self, tasks: &mut JoinSet<()>) {
        let queue = self.queue;
        let name: Arc<str> = Arc::from(self.name);

        {
            let queue = queue.clone();
            tasks.spawn(async move { queue.pump_delayed().await });
        }

        for watch in self.watches {
            let queue = queue.clone();
            let name = name.clone();
            tasks.spawn(async move { pump_watch(&name, watch, &queue).await });
        }

        for worker in 0..self.workers {
            let queue = queue.clone();
            let name = name.clone();
            let reconciler = self.reconciler.clone();
            tasks.spawn(async move { run_worker(&name, worker, reconciler, &queue).await });
        }
    }
}

async fn enqueue_initial(controller: &str, source: &dyn WatchSource, queue: &WorkQueue) {
    match source.initial_keys().await {
        Ok(keys) => {
            for key in keys {
                queue.add(&key);
            }
        }
        Err(e) => error!(
            "Controller {}: initial listing of {} failed: {}",
            controller,
            source.name(),
            e
        ),
    }
}

async fn pump_watch(controller: &str, mut watch: RegisteredWatch, queue: &WorkQueue) {
    enqueue_initial(controller, watch.source.as_ref(), queue).await;

    loop {
        let received = tokio::select! {
            _ = queue.stopped() => return,
            received = watch.events.recv() => received,
        };
        match received {
            Ok(event) => {
                for key in watch.source.map(&event).await {
                    queue.add(&key);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    "Controller {}: watch {} lagged by {} events, relisting",
                    controller,
                    watch.source.name(),
                    skipped
                );
                enqueue_initial(controller, watch.source.as_ref(), queue).await;
            }
            Err(RecvError::Closed) => {
                debug!("Controller {}: watch {} closed", controller, watch.source.name());
                return;
            }
        }
    }
}

async fn run_worker(
    controller: &str,
    worker: usize,
    reconciler: Arc<dyn Reconciler>,
    queue: &WorkQueue,
) {
    debug!("Controller {}: worker {} started", controller, worker);
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(&key).await {
            Ok(Flow::Continue) | Ok(Flow::Forget) => queue.forget(&key),
            Ok(Flow::Requeue) => queue.add_rate_limited(&key),
            Ok(Flow::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(&key, delay);
            }
            Err(e) => {
                error!("Controller {}: reconcile of {} failed: {}", controller, key, e);
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    debug!("Controller {}: worker {} stopped", controller, worker);
}
