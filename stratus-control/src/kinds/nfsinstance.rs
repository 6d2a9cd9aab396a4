//! NfsInstance reconciliation: one managed file instance placed on a Ready IpRange.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use stratus_api::{
    Condition, ConditionType, FileTier, IpRange, NfsInstance, OperationHandle, OperationKind,
    Phase, RecordStore, Scope, reason,
};
use tracing::{debug, info};

use crate::composed::{
    AddFinalizer, Flow, Loaded, PollOperation, Pipeline, ReconcileState, RemoveFinalizer,
    StatusPatch, load_with_fallback, set_error,
};
use crate::context::ControlContext;
use crate::controller::Reconciler;
use crate::diff::{DiffOp, InstanceTarget, NfsInstanceDiff, diff_nfs_instance};
use crate::error::Result;
use crate::provider::{FILE_SHARES_MASK, FilestoreInstance, InstanceState};

/// State of one NfsInstance pass.
pub struct NfsInstanceState {
    ctx: ControlContext,
    scope: Scope,
    store: Arc<dyn RecordStore<NfsInstance>>,
    ip_ranges: Arc<dyn RecordStore<IpRange>>,
    record: NfsInstance,
    ip_range: Option<IpRange>,
    instance: Option<FilestoreInstance>,
    diff: Option<NfsInstanceDiff>,
}

impl NfsInstanceState {
    pub fn new(
        ctx: ControlContext,
        scope: Scope,
        store: Arc<dyn RecordStore<NfsInstance>>,
        ip_ranges: Arc<dyn RecordStore<IpRange>>,
        record: NfsInstance,
    ) -> Self {
        Self {
            ctx,
            scope,
            store,
            ip_ranges,
            record,
            ip_range: None,
            instance: None,
            diff: None,
        }
    }

    /// Zone or region the instance lives in.
    fn location(&self) -> String {
        self.record
            .spec
            .location
            .clone()
            .unwrap_or_else(|| self.scope.region.clone())
    }

    fn instance_name(&self) -> String {
        match &self.instance {
            Some(instance) => instance.name.clone(),
            None => self.record.canonical_instance_name(),
        }
    }

    fn retry(&self) -> Flow {
        Flow::RequeueAfter(self.ctx.config.retry_wait)
    }
}

impl ReconcileState for NfsInstanceState {
    type Record = NfsInstance;

    fn record(&self) -> &NfsInstance {
        &self.record
    }

    fn record_mut(&mut self) -> &mut NfsInstance {
        &mut self.record
    }

    fn store(&self) -> &Arc<dyn RecordStore<NfsInstance>> {
        &self.store
    }

    fn ctx(&self) -> &ControlContext {
        &self.ctx
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Longest file share name accepted for `tier`.
pub fn max_file_share_name_len(tier: FileTier) -> usize {
    if tier.is_basic() { 16 } else { 64 }
}

async fn validate_spec(state: &mut NfsInstanceState) -> Result<Flow> {
    if state.is_deleting() {
        return Ok(Flow::Continue);
    }

    let spec = &state.record.spec;
    let max_len = max_file_share_name_len(spec.tier);
    if spec.file_share_name.is_empty() || spec.file_share_name.len() > max_len {
        let message = format!(
            "{} tier fileShareName length must be between 1 and {} characters",
            spec.tier, max_len
        );
        return set_error(state, reason::TIER_INVALID, message, Flow::Forget).await;
    }

    // A converged capacity was accepted before; a zero status means none was recorded.
    let accepted = state.record.status.capacity_gb;
    if accepted != 0 && spec.capacity_gb == accepted {
        return Ok(Flow::Continue);
    }

    if !spec.tier.accepts_capacity(spec.capacity_gb) {
        let bands: Vec<String> = spec
            .tier
            .capacity_bands()
            .iter()
            .map(|b| {
                if b.step == 1 {
                    format!("{} to {}", b.min, b.max)
                } else {
                    format!("{} to {} in increments of {}", b.min, b.max, b.step)
                }
            })
            .collect();
        let message = format!(
            "capacity {} GB is not valid for tier {}, expected {}",
            spec.capacity_gb,
            spec.tier,
            bands.join(" or ")
        );
        return set_error(state, reason::CAPACITY_INVALID, message, Flow::Forget).await;
    }

    StatusPatch::new(state)
        .remove_condition(ConditionType::Error, reason::CAPACITY_INVALID)
        .apply()
        .await
}

async fn load_ip_range(state: &mut NfsInstanceState) -> Result<Flow> {
    let name = state.record.spec.ip_range.clone();
    let ip_range = state.ip_ranges.get(&name).await?;

    match ip_range {
        Some(range) if range.status.phase == Phase::Ready && !range.status.cidr.is_empty() => {
            state.ip_range = Some(range);
            Ok(Flow::Continue)
        }
        Some(range) => {
            let flow = state.retry();
            let message = format!("IpRange {} is not ready ({})", name, range.status.phase);
            set_error(state, reason::IP_RANGE_NOT_READY, message, flow).await
        }
        None => {
            let flow = state.retry();
            let message = format!("IpRange {} not found", name);
            set_error(state, reason::IP_RANGE_NOT_READY, message, flow).await
        }
    }
}

async fn load_instance(state: &mut NfsInstanceState) -> Result<Flow> {
    let canonical = state.record.canonical_instance_name();
    let legacy = state.record.legacy_instance_name().to_string();
    let providers = state.ctx.providers.clone();
    let project = state.scope.project.clone();
    let location = state.location();
    let fetch = move |name: String| {
        let providers = providers.clone();
        let project = project.clone();
        let location = location.clone();
        async move {
            providers
                .call(providers.filestore.get_instance(&project, &location, &name))
                .await
        }
        .boxed()
    };

    let scope = state.scope.clone();
    let loaded = load_with_fallback(&canonical, Some(&legacy), fetch, |i: &FilestoreInstance| {
        scope.owns_network(&i.network)
    })
    .await;

    match loaded {
        Ok(Loaded::Canonical(instance)) if !state.scope.owns_network(&instance.network) => {
            let message = format!(
                "file instance {} is attached to network {}, expected {}",
                instance.name,
                instance.network,
                state.scope.network_path()
            );
            set_error(state, reason::WRONG_NETWORK, message, Flow::Forget).await
        }
        Ok(loaded) => {
            if let Loaded::Legacy(instance) = &loaded {
                debug!(
                    "NfsInstance {}: using legacy instance {}",
                    state.record.meta.name, instance.name
                );
            }
            state.instance = loaded.into_option();
            Ok(Flow::Continue)
        }
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error loading file instance: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

/// Basic tiers can only grow.
async fn validate_scale_down(state: &mut NfsInstanceState) -> Result<Flow> {
    let Some(instance) = &state.instance else {
        return Ok(Flow::Continue);
    };
    let spec = &state.record.spec;
    if !spec.tier.is_basic() || spec.capacity_gb >= instance.capacity_gb {
        return Ok(Flow::Continue);
    }

    let message = format!(
        "{} tier can not scale down from {} GB to {} GB",
        spec.tier, instance.capacity_gb, spec.capacity_gb
    );
    set_error(state, reason::CAPACITY_SCALE_DOWN, message, Flow::Forget).await
}

/// Only a settled instance is diffed; anything in transition is waited out.
async fn check_instance_state(state: &mut NfsInstanceState) -> Result<Flow> {
    let Some(instance) = &state.instance else {
        return Ok(Flow::Continue);
    };
    let deleting = state.is_deleting();

    match instance.state {
        InstanceState::Ready => Ok(Flow::Continue),
        InstanceState::Error | InstanceState::Suspended if deleting => Ok(Flow::Continue),
        InstanceState::Error => {
            let flow = state.retry();
            let message = format!("file instance {} is in error state", instance.name);
            set_error(state, reason::INSTANCE_ERROR, message, flow).await
        }
        other => {
            debug!(
                "NfsInstance {}: instance {} is {:?}, waiting",
                state.record.meta.name, instance.name, other
            );
            Ok(state.retry())
        }
    }
}

async fn compare(state: &mut NfsInstanceState) -> Result<Flow> {
    let target = InstanceTarget {
        capacity_gb: state.record.spec.capacity_gb,
        file_share_name: state.record.spec.file_share_name.clone(),
    };
    let diff = diff_nfs_instance(&target, state.instance.as_ref(), state.is_deleting());
    debug!(
        "NfsInstance {}: instance {:?}, phase {}",
        state.record.meta.name, diff.instance, diff.phase
    );
    state.diff = Some(diff);
    Ok(Flow::Continue)
}

fn desired_instance(state: &NfsInstanceState, reserved_ip_range: String) -> FilestoreInstance {
    let spec = &state.record.spec;
    FilestoreInstance {
        name: state.record.canonical_instance_name(),
        tier: spec.tier,
        state: InstanceState::Creating,
        capacity_gb: spec.capacity_gb,
        file_share_name: spec.file_share_name.clone(),
        network: state.scope.network_path(),
        reserved_ip_range,
        source_backup: spec.source_backup.clone(),
        ip_addresses: Vec::new(),
    }
}

async fn sync_instance(state: &mut NfsInstanceState) -> Result<Flow> {
    let Some(diff) = state.diff.clone() else {
        return Ok(Flow::Continue);
    };
    let p = state.ctx.providers.clone();
    let project = state.scope.project.clone();
    let location = state.location();

    let result = match diff.instance {
        DiffOp::None => return Ok(Flow::Continue),
        DiffOp::Add => {
            let Some(range) = &state.ip_range else {
                return Ok(Flow::Continue);
            };
            let instance = desired_instance(state, range.status.cidr.clone());
            p.call(p.filestore.create_instance(&project, &location, instance))
                .await
        }
        DiffOp::Modify => {
            let Some(current) = state.instance.clone() else {
                return Ok(Flow::Continue);
            };
            let patched = FilestoreInstance {
                capacity_gb: state.record.spec.capacity_gb,
                file_share_name: state.record.spec.file_share_name.clone(),
                ..current
            };
            p.call(
                p.filestore
                    .patch_instance(&project, &location, patched, FILE_SHARES_MASK),
            )
            .await
        }
        DiffOp::Delete => {
            let name = state.instance_name();
            match p
                .call(p.filestore.delete_instance(&project, &location, &name))
                .await
            {
                Err(err) if err.is_not_found() => {
                    debug!("NfsInstance {}: instance already gone", state.record.meta.name);
                    return Ok(Flow::Continue);
                }
                other => other,
            }
        }
    };

    match result {
        Ok(id) => {
            info!(
                "NfsInstance {}: {:?} operation {} started",
                state.record.meta.name, diff.instance, id
            );
            let flow = Flow::RequeueAfter(state.ctx.config.operation_wait);
            StatusPatch::new(state)
                .phase(diff.phase)
                .operation(Some(OperationHandle::new(id, OperationKind::FilestoreInstance)))
                .flow(flow)
                .apply()
                .await
        }
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error syncing file instance: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

async fn converge_ready(state: &mut NfsInstanceState) -> Result<Flow> {
    let Some(instance) = state.instance.clone() else {
        return Ok(Flow::Continue);
    };
    StatusPatch::new(state)
        .phase(Phase::Ready)
        .exclusive(Condition::ready("NfsInstance is ready"))
        .update(|status| {
            status.instance_id = instance.name;
            status.hosts = instance.ip_addresses;
            status.capacity_gb = instance.capacity_gb;
        })
        .flow(Flow::Forget)
        .apply()
        .await
}

/// The NfsInstance pipeline.
pub fn pipeline() -> Pipeline<NfsInstanceState> {
    let create = Pipeline::<NfsInstanceState>::new("nfsinstance-create")
        .step(PollOperation::default())
        .then("load_ip_range", |s| load_ip_range(s).boxed())
        .then("load_instance", |s| load_instance(s).boxed())
        .then("validate_scale_down", |s| validate_scale_down(s).boxed())
        .then("check_instance_state", |s| check_instance_state(s).boxed())
        .then("compare", |s| compare(s).boxed())
        .then("sync_instance", |s| sync_instance(s).boxed())
        .then("converge_ready", |s| converge_ready(s).boxed());

    let delete = Pipeline::<NfsInstanceState>::new("nfsinstance-delete")
        .step(PollOperation::default())
        .then("load_instance", |s| load_instance(s).boxed())
        .then("check_instance_state", |s| check_instance_state(s).boxed())
        .then("compare", |s| compare(s).boxed())
        .then("sync_instance", |s| sync_instance(s).boxed())
        .step(RemoveFinalizer::default());

    Pipeline::<NfsInstanceState>::new("nfsinstance")
        .then("validate_spec", |s| validate_spec(s).boxed())
        .step(AddFinalizer::default())
        .branch("deleting", |s: &NfsInstanceState| s.is_deleting(), delete, create)
}

/// Reconciles NfsInstance records of one cluster.
pub struct NfsInstanceReconciler {
    ctx: ControlContext,
    scope: Scope,
    store: Arc<dyn RecordStore<NfsInstance>>,
    ip_ranges: Arc<dyn RecordStore<IpRange>>,
    pipeline: Pipeline<NfsInstanceState>,
}

impl NfsInstanceReconciler {
    pub fn new(
        ctx: ControlContext,
        scope: Scope,
        store: Arc<dyn RecordStore<NfsInstance>>,
        ip_ranges: Arc<dyn RecordStore<IpRange>>,
    ) -> Self {
        Self {
            ctx,
            scope,
            store,
            ip_ranges,
            pipeline: pipeline(),
        }
    }
}

#[async_trait]
impl Reconciler for NfsInstanceReconciler {
    async fn reconcile(&self, key: &str) -> Result<Flow> {
        let Some(record) = self.store.get(key).await? else {
            debug!("NfsInstance {} no longer exists", key);
            return Ok(Flow::Forget);
        };

        debug!("Reconciling NfsInstance {} ({})", key, record.meta.uid);
        let mut state = NfsInstanceState::new(
            self.ctx.clone(),
            self.scope.clone(),
            self.store.clone(),
            self.ip_ranges.clone(),
            record,
        );
        let flow = self.pipeline.run(&mut state).await?;
        Ok(if flow.is_continue() { Flow::Forget } else { flow })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stratus_api::{FINALIZER, IpRangeSpec, MemoryStore, NfsInstanceSpec};

    use super::*;
    use crate::config::ControlConfig;
    use crate::provider::SimProvider;

    struct Fixture {
        sim: Arc<SimProvider>,
        reconciler: NfsInstanceReconciler,
        store: Arc<MemoryStore<NfsInstance>>,
        ip_ranges: Arc<MemoryStore<IpRange>>,
    }

    fn make_fixture() -> Fixture {
        let sim = Arc::new(SimProvider::new());
        let config = ControlConfig {
            retry_wait: Duration::from_millis(10),
            operation_wait: Duration::from_millis(10),
            api_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let ctx = ControlContext::simulated(config, sim.clone());
        let store = Arc::new(MemoryStore::<NfsInstance>::new());
        let ip_ranges = Arc::new(MemoryStore::<IpRange>::new());
        let reconciler = NfsInstanceReconciler::new(
            ctx,
            Scope::new("p1", "vpc", "us-east1"),
            store.clone(),
            ip_ranges.clone(),
        );
        Fixture {
            sim,
            reconciler,
            store,
            ip_ranges,
        }
    }

    fn make_spec(tier: FileTier, capacity_gb: u64) -> NfsInstanceSpec {
        NfsInstanceSpec {
            ip_range: "range".into(),
            tier,
            capacity_gb,
            file_share_name: "vol1".into(),
            location: None,
            source_backup: None,
        }
    }

    fn error_reason(record: &NfsInstance) -> Option<String> {
        Condition::find(&record.status.conditions, ConditionType::Error).map(|c| c.reason.clone())
    }

    #[test]
    fn test_file_share_name_limits() {
        assert_eq!(max_file_share_name_len(FileTier::BasicHdd), 16);
        assert_eq!(max_file_share_name_len(FileTier::Premium), 16);
        assert_eq!(max_file_share_name_len(FileTier::Standard), 16);
        assert_eq!(max_file_share_name_len(FileTier::Regional), 64);
        assert_eq!(max_file_share_name_len(FileTier::Enterprise), 64);
    }

    #[tokio::test]
    async fn test_zero_capacity_on_new_record_is_invalid() {
        let f = make_fixture();
        f.store
            .create(NfsInstance::new("n1", make_spec(FileTier::BasicHdd, 0)))
            .await
            .unwrap();

        assert_eq!(f.reconciler.reconcile("n1").await.unwrap(), Flow::Forget);
        let record = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(record.status.phase, Phase::Error);
        assert_eq!(error_reason(&record).as_deref(), Some(reason::CAPACITY_INVALID));
        assert!(f.sim.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_premium_share_name_over_sixteen_is_tier_invalid() {
        let f = make_fixture();
        let mut spec = make_spec(FileTier::Premium, 2560);
        spec.file_share_name = "a-twenty-char-share1".into();
        f.store.create(NfsInstance::new("n1", spec)).await.unwrap();

        assert_eq!(f.reconciler.reconcile("n1").await.unwrap(), Flow::Forget);
        let record = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(error_reason(&record).as_deref(), Some(reason::TIER_INVALID));
        assert!(f.sim.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_capacity_is_terminal() {
        let f = make_fixture();
        f.store
            .create(NfsInstance::new("n1", make_spec(FileTier::BasicSsd, 1024)))
            .await
            .unwrap();

        assert_eq!(f.reconciler.reconcile("n1").await.unwrap(), Flow::Forget);
        let record = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(record.status.phase, Phase::Error);
        assert_eq!(error_reason(&record).as_deref(), Some(reason::CAPACITY_INVALID));
        assert!(f.sim.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_long_share_name_is_tier_invalid() {
        let f = make_fixture();
        let mut spec = make_spec(FileTier::BasicHdd, 1024);
        spec.file_share_name = "a-share-name-longer-than-sixteen".into();
        f.store.create(NfsInstance::new("n1", spec)).await.unwrap();

        assert_eq!(f.reconciler.reconcile("n1").await.unwrap(), Flow::Forget);
        let record = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(error_reason(&record).as_deref(), Some(reason::TIER_INVALID));
    }

    #[tokio::test]
    async fn test_waits_for_ip_range() {
        let f = make_fixture();
        f.ip_ranges
            .create(IpRange::new("range", IpRangeSpec::new("10.20.30.0/24")))
            .await
            .unwrap();
        f.store
            .create(NfsInstance::new("n1", make_spec(FileTier::BasicHdd, 1024)))
            .await
            .unwrap();

        let flow = f.reconciler.reconcile("n1").await.unwrap();
        assert_eq!(flow, Flow::RequeueAfter(Duration::from_millis(10)));
        let record = f.store.get("n1").await.unwrap().unwrap();
        assert!(record.meta.has_finalizer(FINALIZER));
        assert_eq!(error_reason(&record).as_deref(), Some(reason::IP_RANGE_NOT_READY));
        assert!(f.sim.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_creates_on_ready_ip_range() {
        let f = make_fixture();
        let mut range = f
            .ip_ranges
            .create(IpRange::new("range", IpRangeSpec::new("10.20.30.0/24")))
            .await
            .unwrap();
        range.status.phase = Phase::Ready;
        range.status.cidr = "10.20.30.0/24".into();
        f.ip_ranges.patch_status("range", range.status).await.unwrap();
        f.store
            .create(NfsInstance::new("n1", make_spec(FileTier::BasicHdd, 1024)))
            .await
            .unwrap();

        let flow = f.reconciler.reconcile("n1").await.unwrap();
        assert_eq!(flow, Flow::RequeueAfter(Duration::from_millis(10)));

        let record = f.store.get("n1").await.unwrap().unwrap();
        assert_eq!(record.status.phase, Phase::Creating);
        let op = record.status.operation.clone().unwrap();
        assert_eq!(op.kind, OperationKind::FilestoreInstance);

        let created = f
            .sim
            .instance("p1", "us-east1", &record.canonical_instance_name())
            .unwrap();
        assert_eq!(created.reserved_ip_range, "10.20.30.0/24");
        assert_eq!(created.state, InstanceState::Creating);
    }
}
