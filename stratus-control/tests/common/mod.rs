//! Shared test utilities for stratus-control integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stratus_api::{
    Condition, ConditionType, FileTier, IpRange, IpRangeSpec, MemoryStore, NfsInstance,
    NfsInstanceSpec, RecordStore, Scope,
};
use stratus_control::composed::Flow;
use stratus_control::controller::Reconciler;
use stratus_control::kinds::{IpRangeReconciler, NfsInstanceReconciler};
use stratus_control::provider::SimProvider;
use stratus_control::{ClusterConnection, ControlConfig, ControlContext};

pub const PROJECT: &str = "p1";
pub const PROJECT_NUMBER: u64 = 4242;
pub const VPC: &str = "vpc";
pub const REGION: &str = "us-east1";
pub const CIDR: &str = "10.20.30.0/24";

/// Passes after which a record that still wants work is considered stuck.
const MAX_PASSES: usize = 50;

/// Millisecond-scale durations so looper tests finish quickly.
pub fn fast_config() -> ControlConfig {
    ControlConfig {
        retry_wait: Duration::from_millis(10),
        operation_wait: Duration::from_millis(10),
        api_timeout: Duration::from_secs(1),
        concurrency: 1,
        emit_interval: Duration::from_millis(10),
        cluster_timeout: Duration::from_secs(2),
        connect_backoff: Duration::from_millis(10),
        manager_timeout: Duration::from_millis(500),
        max_concurrent_reconciles: 1,
    }
}

pub fn network_path() -> String {
    format!("projects/{}/global/networks/{}", PROJECT, VPC)
}

pub fn nfs_spec(ip_range: &str, tier: FileTier, capacity_gb: u64) -> NfsInstanceSpec {
    NfsInstanceSpec {
        ip_range: ip_range.into(),
        tier,
        capacity_gb,
        file_share_name: "vol1".into(),
        location: None,
        source_backup: None,
    }
}

/// Reason of the record's Error condition, if it has one.
pub fn error_reason(conditions: &[Condition]) -> Option<String> {
    Condition::find(conditions, ConditionType::Error).map(|c| c.reason.clone())
}

pub fn is_ready(conditions: &[Condition]) -> bool {
    Condition::is_true(conditions, ConditionType::Ready)
}

/// One simulated remote cluster with both reconcilers wired to its stores.
pub struct TestCluster {
    pub sim: Arc<SimProvider>,
    pub ctx: ControlContext,
    pub scope: Scope,
    pub ip_ranges: Arc<MemoryStore<IpRange>>,
    pub nfs_instances: Arc<MemoryStore<NfsInstance>>,
    pub ip_range_reconciler: IpRangeReconciler,
    pub nfs_instance_reconciler: NfsInstanceReconciler,
}

impl TestCluster {
    pub fn new() -> Self {
        let sim = Arc::new(SimProvider::new());
        sim.set_project_number(PROJECT, PROJECT_NUMBER);
        let ctx = ControlContext::simulated(fast_config(), sim.clone());
        let scope = Scope::new(PROJECT, VPC, REGION);
        let ip_ranges = Arc::new(MemoryStore::<IpRange>::new());
        let nfs_instances = Arc::new(MemoryStore::<NfsInstance>::new());

        let ip_range_reconciler =
            IpRangeReconciler::new(ctx.clone(), scope.clone(), ip_ranges.clone());
        let nfs_instance_reconciler = NfsInstanceReconciler::new(
            ctx.clone(),
            scope.clone(),
            nfs_instances.clone(),
            ip_ranges.clone(),
        );

        Self {
            sim,
            ctx,
            scope,
            ip_ranges,
            nfs_instances,
            ip_range_reconciler,
            nfs_instance_reconciler,
        }
    }

    pub fn connection(&self, cluster_id: &str) -> ClusterConnection {
        ClusterConnection {
            cluster_id: cluster_id.into(),
            scope: self.scope.clone(),
            ip_ranges: self.ip_ranges.clone(),
            nfs_instances: self.nfs_instances.clone(),
        }
    }

    pub async fn create_ip_range(&self, name: &str, spec: IpRangeSpec) -> IpRange {
        self.ip_ranges
            .create(IpRange::new(name, spec))
            .await
            .expect("Failed to create IpRange")
    }

    pub async fn create_nfs_instance(&self, name: &str, spec: NfsInstanceSpec) -> NfsInstance {
        self.nfs_instances
            .create(NfsInstance::new(name, spec))
            .await
            .expect("Failed to create NfsInstance")
    }

    pub async fn ip_range(&self, name: &str) -> Option<IpRange> {
        self.ip_ranges.get(name).await.expect("Failed to get IpRange")
    }

    pub async fn nfs_instance(&self, name: &str) -> Option<NfsInstance> {
        self.nfs_instances
            .get(name)
            .await
            .expect("Failed to get NfsInstance")
    }

    /// Reconcile `name` until a pass ends without asking for more work.
    pub async fn drive_ip_range(&self, name: &str) -> Flow {
        drive(&self.ip_range_reconciler, name).await
    }

    pub async fn drive_nfs_instance(&self, name: &str) -> Flow {
        drive(&self.nfs_instance_reconciler, name).await
    }

    /// Create an IpRange and drive it to Ready.
    pub async fn ready_ip_range(&self, name: &str, cidr: &str) -> IpRange {
        self.create_ip_range(name, IpRangeSpec::new(cidr)).await;
        self.drive_ip_range(name).await;
        let range = self.ip_range(name).await.expect("IpRange vanished");
        assert!(is_ready(&range.status.conditions), "{} not ready: {:?}", name, range.status);
        range
    }

    /// Methods of the provider mutations seen since the last clear.
    pub fn mutation_methods(&self) -> Vec<&'static str> {
        self.sim.mutations().iter().map(|call| call.method).collect()
    }
}

async fn drive(reconciler: &dyn Reconciler, name: &str) -> Flow {
    for _ in 0..MAX_PASSES {
        let flow = reconciler
            .reconcile(name)
            .await
            .expect("Reconcile pass failed");
        match flow {
            Flow::Requeue | Flow::RequeueAfter(_) => continue,
            other => return other,
        }
    }
    panic!("{} did not settle within {} passes", name, MAX_PASSES);
}

/// Poll `check` every 10ms until it holds or `timeout` expires.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
