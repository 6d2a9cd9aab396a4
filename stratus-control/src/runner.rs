//! Per-cluster runner: builds one controller per resource kind and runs the manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use stratus_api::{IpRange, NfsInstance, Resource};
use tracing::{debug, error, info, warn};

use crate::connection::ClusterConnection;
use crate::context::ControlContext;
use crate::controller::{Controller, IpRangeReferenceWatch, Reconciler, RecordWatch, WatchSource};
use crate::error::{ControlError, Result};
use crate::kinds::{IpRangeReconciler, NfsInstanceReconciler};
use crate::manager::Manager;

/// Describes how to reconcile one resource kind against a cluster.
pub trait ResourceKind: Send + Sync {
    /// Descriptor name used in logs.
    fn name(&self) -> &'static str;

    /// Record kind the controller reconciles.
    fn kind(&self) -> &'static str;

    fn build_reconciler(
        &self,
        ctx: &ControlContext,
        conn: &ClusterConnection,
    ) -> Result<Arc<dyn Reconciler>>;

    fn watches(&self, conn: &ClusterConnection) -> Vec<Box<dyn WatchSource>>;
}

pub struct IpRangeKind;

impl ResourceKind for IpRangeKind {
    fn name(&self) -> &'static str {
        "iprange"
    }

    fn kind(&self) -> &'static str {
        IpRange::KIND
    }

    fn build_reconciler(
        &self,
        ctx: &ControlContext,
        conn: &ClusterConnection,
    ) -> Result<Arc<dyn Reconciler>> {
        Ok(Arc::new(IpRangeReconciler::new(
            ctx.clone(),
            conn.scope.clone(),
            conn.ip_ranges.clone(),
        )))
    }

    fn watches(&self, conn: &ClusterConnection) -> Vec<Box<dyn WatchSource>> {
        vec![Box::new(RecordWatch::new(conn.ip_ranges.clone())) as Box<dyn WatchSource>]
    }
}

pub struct NfsInstanceKind;

impl ResourceKind for NfsInstanceKind {
    fn name(&self) -> &'static str {
        "nfsinstance"
    }

    fn kind(&self) -> &'static str {
        NfsInstance::KIND
    }

    fn build_reconciler(
        &self,
        ctx: &ControlContext,
        conn: &ClusterConnection,
    ) -> Result<Arc<dyn Reconciler>> {
        Ok(Arc::new(NfsInstanceReconciler::new(
            ctx.clone(),
            conn.scope.clone(),
            conn.nfs_instances.clone(),
            conn.ip_ranges.clone(),
        )))
    }

    fn watches(&self, conn: &ClusterConnection) -> Vec<Box<dyn WatchSource>> {
        let own: Box<dyn WatchSource> = Box::new(RecordWatch::new(conn.nfs_instances.clone()));
        let references: Box<dyn WatchSource> = Box::new(IpRangeReferenceWatch::new(
            conn.ip_ranges.clone(),
            conn.nfs_instances.clone(),
        ));
        vec![own, references]
    }
}

/// Every kind the control plane knows about.
pub fn default_kinds() -> Vec<Arc<dyn ResourceKind>> {
    let ip_range: Arc<dyn ResourceKind> = Arc::new(IpRangeKind);
    let nfs_instance: Arc<dyn ResourceKind> = Arc::new(NfsInstanceKind);
    vec![ip_range, nfs_instance]
}

/// Options for one runner invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Bound for the manager run.
    pub timeout: Duration,
    /// Time in-flight passes get to finish once `timeout` passed.
    pub grace: Duration,
    /// Record kinds whose controllers are not started.
    pub disabled_kinds: HashSet<String>,
    pub max_concurrent_reconciles: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            grace: Duration::from_secs(8),
            disabled_kinds: HashSet::new(),
            max_concurrent_reconciles: 1,
        }
    }
}

/// Runs the controllers of one cluster. A runner runs at most once.
pub struct Runner {
    ctx: ControlContext,
    kinds: Vec<Arc<dyn ResourceKind>>,
    started: AtomicBool,
}

impl Runner {
    pub fn new(ctx: ControlContext, kinds: Vec<Arc<dyn ResourceKind>>) -> Self {
        Self {
            ctx,
            kinds,
            started: AtomicBool::new(false),
        }
    }

    /// Build controllers for `conn` and run them until `opts.timeout`, then
    /// drain them for at most `opts.grace`.
    ///
    /// Only a second call fails. Controllers that fail to build or to watch
    /// are skipped, and manager errors are logged.
    pub async fn run(&self, conn: ClusterConnection, opts: RunOptions) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ControlError::AlreadyStarted("runner"));
        }

        let cluster = conn.cluster_id.clone();
        let mut manager = Manager::new(cluster.clone());

        for descriptor in &self.kinds {
            if opts.disabled_kinds.contains(descriptor.kind()) {
                info!(cluster = %cluster, "Skipping disabled kind {}", descriptor.kind());
                continue;
            }

            let reconciler = match descriptor.build_reconciler(&self.ctx, &conn) {
                Ok(reconciler) => reconciler,
                Err(e) => {
                    error!(
                        cluster = %cluster,
                        "Failed to build {} controller: {}",
                        descriptor.name(),
                        e
                    );
                    continue;
                }
            };

            let mut controller =
                Controller::new(descriptor.name(), reconciler, opts.max_concurrent_reconciles);
            let mut registered = true;
            for watch in descriptor.watches(&conn) {
                let source = watch.name().to_string();
                if let Err(e) = controller.watch(watch) {
                    warn!(
                        cluster = %cluster,
                        "Failed to watch {} for {} controller: {}",
                        source,
                        descriptor.name(),
                        e
                    );
                    registered = false;
                    break;
                }
            }
            if !registered {
                continue;
            }

            debug!(cluster = %cluster, "Registered {} controller", descriptor.name());
            manager.add(controller);
        }

        if let Err(e) = manager.run(opts.timeout, opts.grace).await {
            error!(cluster = %cluster, "Manager failed: {}", e);
        }
        Ok(())
    }
}
