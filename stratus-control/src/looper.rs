//! Multi-cluster looper: fans the active cluster set out to a bounded worker pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionFactory;
use crate::context::ControlContext;
use crate::error::{ControlError, Result};
use crate::runner::{ResourceKind, RunOptions, Runner};

/// The set of active remote clusters.
#[derive(Debug, Default)]
pub struct ClusterMembership {
    ids: RwLock<Vec<String>>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `id` was already a member.
    pub fn add(&self, id: &str) -> bool {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        if ids.iter().any(|existing| existing == id) {
            return false;
        }
        ids.push(id.to_string());
        true
    }

    /// Returns false if `id` was not a member.
    pub fn remove(&self, id: &str) -> bool {
        let mut ids = self.ids.write().unwrap_or_else(PoisonError::into_inner);
        match ids.iter().position(|existing| existing == id) {
            Some(pos) => {
                ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        let ids = self.ids.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter().any(|existing| existing == id)
    }

    /// Copy of the current members; the lock is released before returning.
    pub fn snapshot(&self) -> Vec<String> {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handles one dispatched cluster id at a time.
#[derive(Clone)]
struct ClusterWorker {
    factory: Arc<dyn ConnectionFactory>,
    ctx: ControlContext,
    kinds: Vec<Arc<dyn ResourceKind>>,
    disabled_kinds: HashSet<String>,
}

impl ClusterWorker {
    /// The manager run plus its drain fits inside `cluster_timeout`, so the
    /// hard abort in [`ClusterWorker::handle`] only hits passes that overrun the drain.
    fn run_options(&self) -> RunOptions {
        let config = &self.ctx.config;
        let grace = config.api_timeout.min(config.cluster_timeout / 2);
        RunOptions {
            timeout: config
                .manager_timeout
                .min(config.cluster_timeout.saturating_sub(grace)),
            grace,
            disabled_kinds: self.disabled_kinds.clone(),
            max_concurrent_reconciles: config.max_concurrent_reconciles,
        }
    }

    async fn handle(&self, cluster_id: &str) {
        let config = &self.ctx.config;
        let conn = match self.factory.build(cluster_id).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(
                    cluster = %cluster_id,
                    "Failed to build connection: {}. Backing off for {:?}",
                    e,
                    config.connect_backoff
                );
                tokio::time::sleep(config.connect_backoff).await;
                return;
            }
        };

        // A fresh runner per invocation; a panic stays inside the spawned task.
        let runner = Runner::new(self.ctx.clone(), self.kinds.clone());
        let opts = self.run_options();
        let handle = tokio::spawn(async move { runner.run(conn, opts).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(config.cluster_timeout, handle).await {
            Ok(Ok(Ok(()))) => debug!(cluster = %cluster_id, "Cluster run finished"),
            Ok(Ok(Err(e))) => error!(cluster = %cluster_id, "Cluster run failed: {}", e),
            Ok(Err(e)) => error!(cluster = %cluster_id, "Cluster run aborted: {}", e),
            Err(_) => {
                warn!(
                    cluster = %cluster_id,
                    "Cluster run exceeded {:?}, aborting",
                    config.cluster_timeout
                );
                abort.abort();
            }
        }
    }
}

/// Resolves once shutdown was requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drives every member cluster through a fresh [`Runner`], `concurrency` at a time.
pub struct Looper {
    membership: Arc<ClusterMembership>,
    worker: ClusterWorker,
    started: AtomicBool,
}

impl Looper {
    pub fn new(
        ctx: ControlContext,
        factory: Arc<dyn ConnectionFactory>,
        kinds: Vec<Arc<dyn ResourceKind>>,
    ) -> Self {
        Self {
            membership: Arc::new(ClusterMembership::new()),
            worker: ClusterWorker {
                factory,
                ctx,
                kinds,
                disabled_kinds: HashSet::new(),
            },
            started: AtomicBool::new(false),
        }
    }

    /// Record kinds no runner starts a controller for.
    pub fn with_disabled_kinds(mut self, kinds: impl IntoIterator<Item = String>) -> Self {
        self.worker.disabled_kinds = kinds.into_iter().collect();
        self
    }

    pub fn membership(&self) -> Arc<ClusterMembership> {
        self.membership.clone()
    }

    pub fn add_cluster_id(&self, id: &str) {
        if self.membership.add(id) {
            info!(cluster = %id, "Cluster added");
        }
    }

    pub fn remove_cluster_id(&self, id: &str) {
        if self.membership.remove(id) {
            info!(cluster = %id, "Cluster removed");
        }
    }

    /// Run until `shutdown` turns true. Only the first call is accepted.
    ///
    /// Emission stops right away on shutdown; workers finish the cluster they
    /// are handling before this returns.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ControlError::AlreadyStarted("looper"));
        }

        let config = &self.worker.ctx.config;
        let concurrency = config.concurrency.max(1);
        info!(
            "Starting looper with {} workers, emitting every {:?}",
            concurrency, config.emit_interval
        );

        let (tx, rx) = mpsc::channel::<String>(concurrency);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for n in 0..concurrency {
            let rx = rx.clone();
            let worker = self.worker.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => None,
                        id = async { rx.lock().await.recv().await } => id,
                    };
                    let Some(id) = next else {
                        break;
                    };
                    debug!(cluster = %id, "Worker {} picked up cluster", n);
                    worker.handle(&id).await;
                }
                debug!("Worker {} stopped", n);
            });
        }

        self.emit(tx, shutdown).await;

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Looper worker failed: {}", e);
            }
        }
        info!("Looper stopped");
        Ok(())
    }

    async fn emit(&self, tx: mpsc::Sender<String>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.worker.ctx.config.emit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'emit: loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break 'emit,
                _ = ticker.tick() => {}
            }

            for id in self.membership.snapshot() {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => break 'emit,
                    sent = tx.send(id) => {
                        if sent.is_err() {
                            break 'emit;
                        }
                    }
                }
            }
        }
        debug!("Membership emission stopped");
    }
}
