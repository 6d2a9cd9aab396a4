//! IpRange reconciliation.
//!
//! The global address is the primary sub-resource. For private service
//! access the peering connection is the secondary: it lists the names of
//! every peering address the service may allocate from.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use ipnet::Ipv4Net;
use stratus_api::{
    Condition, ConditionType, IpRange, IpRangePurpose, OperationHandle, OperationKind, Phase,
    RecordStore, Scope, reason,
};
use tracing::{debug, info};

use crate::composed::{
    AddFinalizer, Flow, Loaded, PollOperation, Pipeline, ReconcileState, RemoveFinalizer,
    StatusPatch, load_with_fallback, set_error,
};
use crate::context::ControlContext;
use crate::controller::Reconciler;
use crate::diff::{AddressTarget, DiffOp, IpRangeDiff, diff_ip_range, peering_target};
use crate::error::Result;
use crate::provider::{Address, AddressPurpose, SERVICE_NETWORKING, ServiceConnection};

/// State of one IpRange pass.
pub struct IpRangeState {
    ctx: ControlContext,
    scope: Scope,
    store: Arc<dyn RecordStore<IpRange>>,
    record: IpRange,
    cidr: Option<Ipv4Net>,
    address: Option<Address>,
    connection: Option<ServiceConnection>,
    peering: Vec<String>,
    diff: Option<IpRangeDiff>,
}

impl IpRangeState {
    pub fn new(
        ctx: ControlContext,
        scope: Scope,
        store: Arc<dyn RecordStore<IpRange>>,
        record: IpRange,
    ) -> Self {
        Self {
            ctx,
            scope,
            store,
            record,
            cidr: None,
            address: None,
            connection: None,
            peering: Vec::new(),
            diff: None,
        }
    }

    fn is_psa(&self) -> bool {
        self.record.spec.purpose == IpRangePurpose::Psa
    }

    /// Name this record's address goes by at the provider.
    fn own_address_name(&self) -> String {
        match &self.address {
            Some(address) => address.name.clone(),
            None => self.record.canonical_address_name(),
        }
    }

    fn retry(&self) -> Flow {
        Flow::RequeueAfter(self.ctx.config.retry_wait)
    }
}

impl ReconcileState for IpRangeState {
    type Record = IpRange;

    fn record(&self) -> &IpRange {
        &self.record
    }

    fn record_mut(&mut self) -> &mut IpRange {
        &mut self.record
    }

    fn store(&self) -> &Arc<dyn RecordStore<IpRange>> {
        &self.store
    }

    fn ctx(&self) -> &ControlContext {
        &self.ctx
    }

    fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Parse `cidr` as an IPv4 network without host bits.
pub fn parse_cidr(cidr: &str) -> std::result::Result<Ipv4Net, String> {
    let net = cidr.trim().parse::<Ipv4Net>().map_err(|e| e.to_string())?;
    if net.addr() != net.network() {
        return Err(format!("host bits set, expected {}", net.trunc()));
    }
    Ok(net)
}

async fn validate_cidr(state: &mut IpRangeState) -> Result<Flow> {
    if state.is_deleting() {
        return Ok(Flow::Continue);
    }

    match parse_cidr(&state.record.spec.cidr) {
        Ok(net) => {
            state.cidr = Some(net);
            Ok(Flow::Continue)
        }
        Err(e) => {
            let message = format!("invalid cidr {}: {}", state.record.spec.cidr, e);
            set_error(state, reason::INVALID_CIDR, message, Flow::Forget).await
        }
    }
}

/// A reserved cidr never changes. Once rejected the record stays rejected
/// until the spec is set back.
async fn guard_cidr_immutable(state: &mut IpRangeState) -> Result<Flow> {
    let status = &state.record.status;
    if status.cidr.is_empty() || status.cidr == state.record.spec.cidr {
        return Ok(Flow::Continue);
    }

    let rejected = Condition::find(&status.conditions, ConditionType::Error)
        .is_some_and(|c| c.reason == reason::CIDR_CAN_NOT_BE_CHANGED);
    if status.phase != Phase::Ready && !rejected {
        return Ok(Flow::Continue);
    }

    let message = format!(
        "cidr can not be changed from {} to {}",
        status.cidr, state.record.spec.cidr
    );
    set_error(state, reason::CIDR_CAN_NOT_BE_CHANGED, message, Flow::Forget).await
}

async fn load_address(state: &mut IpRangeState) -> Result<Flow> {
    let canonical = state.record.canonical_address_name();
    let legacy = state.record.legacy_address_name().map(str::to_string);
    let providers = state.ctx.providers.clone();
    let project = state.scope.project.clone();
    let fetch = move |name: String| {
        let providers = providers.clone();
        let project = project.clone();
        async move {
            providers
                .call(providers.address.get_address(&project, &name))
                .await
        }
        .boxed()
    };

    let scope = state.scope.clone();
    let loaded = load_with_fallback(&canonical, legacy.as_deref(), fetch, |a: &Address| {
        scope.owns_network(&a.network)
    })
    .await;

    match loaded {
        Ok(Loaded::Canonical(address)) if !scope.owns_network(&address.network) => {
            let message = format!(
                "address {} belongs to network {}, expected {}",
                address.name, address.network, scope.vpc_network
            );
            set_error(state, reason::WRONG_NETWORK, message, Flow::Forget).await
        }
        Ok(loaded) => {
            if let Loaded::Legacy(address) = &loaded {
                debug!("IpRange {}: using legacy address {}", state.record.meta.name, address.name);
            }
            state.address = loaded.into_option();
            Ok(Flow::Continue)
        }
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error loading address: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

async fn load_connection(state: &mut IpRangeState) -> Result<Flow> {
    if !state.is_psa() {
        return Ok(Flow::Continue);
    }

    let network = state.scope.network_path();
    let p = state.ctx.providers.clone();
    let result = p
        .call(p.networking.list_connections(&state.scope.project, &network))
        .await;

    match result {
        Ok(connections) => {
            state.connection = connections
                .into_iter()
                .find(|c| c.service == SERVICE_NETWORKING);
            Ok(Flow::Continue)
        }
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error loading service connection: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

/// Compute the peering ranges the connection should carry after this pass.
async fn identify_peering(state: &mut IpRangeState) -> Result<Flow> {
    if !state.is_psa() {
        return Ok(Flow::Continue);
    }

    let network = state.scope.network_path();
    let p = state.ctx.providers.clone();
    let result = p
        .call(p.address.list_addresses(&state.scope.project, &network))
        .await;

    match result {
        Ok(addresses) => {
            let peering_addresses: Vec<String> = addresses
                .into_iter()
                .filter(|a| a.purpose == AddressPurpose::VpcPeering)
                .map(|a| a.name)
                .collect();
            let current = state
                .connection
                .as_ref()
                .map(|c| c.reserved_peering_ranges.clone())
                .unwrap_or_default();
            let own = state.own_address_name();
            state.peering =
                peering_target(&current, &peering_addresses, &own, state.is_deleting());
            Ok(Flow::Continue)
        }
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error listing peering addresses: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

async fn compare(state: &mut IpRangeState) -> Result<Flow> {
    let target = state.cidr.map(|net| AddressTarget {
        address: net.network().to_string(),
        prefix: net.prefix_len(),
        network: state.scope.network_path(),
    });
    let diff = diff_ip_range(
        target.as_ref(),
        state.address.as_ref(),
        state.connection.as_ref(),
        &state.peering,
        state.record.spec.purpose,
        state.is_deleting(),
    );
    debug!(
        "IpRange {}: address {:?}, connection {:?}, phase {}",
        state.record.meta.name, diff.address, diff.connection, diff.phase
    );
    state.diff = Some(diff);
    Ok(Flow::Continue)
}

/// Persist the handle of a dispatched operation and wait for it.
async fn await_operation(
    state: &mut IpRangeState,
    phase: Phase,
    id: String,
    kind: OperationKind,
) -> Result<Flow> {
    info!("IpRange {}: {} operation {} started", state.record.meta.name, kind, id);
    let flow = Flow::RequeueAfter(state.ctx.config.operation_wait);
    StatusPatch::new(state)
        .phase(phase)
        .operation(Some(OperationHandle::new(id, kind)))
        .flow(flow)
        .apply()
        .await
}

async fn sync_address(state: &mut IpRangeState) -> Result<Flow> {
    let Some(diff) = state.diff.clone() else {
        return Ok(Flow::Continue);
    };
    let p = state.ctx.providers.clone();
    let project = state.scope.project.clone();

    let result = match diff.address {
        DiffOp::None => return Ok(Flow::Continue),
        DiffOp::Modify => {
            let name = state.own_address_name();
            let message = format!(
                "address {} does not match cidr {}; addresses can not be modified",
                name, state.record.spec.cidr
            );
            return set_error(state, reason::ADDRESS_MISMATCH, message, Flow::Forget).await;
        }
        DiffOp::Add => {
            let Some(net) = state.cidr else {
                return Ok(Flow::Continue);
            };
            let purpose = match state.record.spec.purpose {
                IpRangePurpose::Psa => AddressPurpose::VpcPeering,
                IpRangePurpose::Psc => AddressPurpose::PrivateServiceConnect,
            };
            let address = Address {
                name: state.record.canonical_address_name(),
                address: net.network().to_string(),
                prefix_length: net.prefix_len(),
                network: state.scope.network_path(),
                purpose,
            };
            p.call(p.address.insert_address(&project, address)).await
        }
        DiffOp::Delete => {
            let name = state.own_address_name();
            match p.call(p.address.delete_address(&project, &name)).await {
                Err(err) if err.is_not_found() => {
                    debug!("IpRange {}: address {} already gone", state.record.meta.name, name);
                    return Ok(Flow::Continue);
                }
                other => other,
            }
        }
    };

    match result {
        Ok(id) => await_operation(state, diff.phase, id, OperationKind::Address).await,
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error syncing address: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

async fn sync_connection(state: &mut IpRangeState) -> Result<Flow> {
    let Some(diff) = state.diff.clone() else {
        return Ok(Flow::Continue);
    };
    let p = state.ctx.providers.clone();
    let project = state.scope.project.clone();
    let network = state.scope.network_path();
    let ranges = state.peering.clone();

    let result = match diff.connection {
        DiffOp::None => return Ok(Flow::Continue),
        DiffOp::Add => {
            p.call(p.networking.create_connection(&project, &network, ranges))
                .await
        }
        DiffOp::Modify => {
            p.call(p.networking.patch_connection(&project, &network, ranges))
                .await
        }
        DiffOp::Delete => match state.ctx.project_numbers.get(&project).await {
            Ok(number) => match p.call(p.networking.delete_connection(number, &network)).await {
                Err(err) if err.is_not_found() => {
                    debug!("IpRange {}: connection already gone", state.record.meta.name);
                    return Ok(Flow::Continue);
                }
                other => other,
            },
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(id) => await_operation(state, diff.phase, id, OperationKind::ServiceConnection).await,
        Err(err) => {
            let flow = state.retry();
            let message = format!("Error syncing service connection: {}", err);
            set_error(state, reason::PROVIDER_ERROR, message, flow).await
        }
    }
}

async fn converge_ready(state: &mut IpRangeState) -> Result<Flow> {
    let Some(address) = state.address.clone() else {
        return Ok(Flow::Continue);
    };
    let cidr = state.record.spec.cidr.clone();
    StatusPatch::new(state)
        .phase(Phase::Ready)
        .exclusive(Condition::ready("IpRange is ready"))
        .update(|status| {
            status.cidr = cidr;
            status.address_name = address.name;
            status.ip_address = address.address;
            status.prefix = address.prefix_length;
        })
        .flow(Flow::Forget)
        .apply()
        .await
}

/// The IpRange pipeline: create/update works the address first, deletion
/// releases the peering reference first.
pub fn pipeline() -> Pipeline<IpRangeState> {
    let create = Pipeline::<IpRangeState>::new("iprange-create")
        .then("guard_cidr_immutable", |s| guard_cidr_immutable(s).boxed())
        .step(PollOperation::default())
        .then("load_address", |s| load_address(s).boxed())
        .then("load_connection", |s| load_connection(s).boxed())
        .then("identify_peering", |s| identify_peering(s).boxed())
        .then("compare", |s| compare(s).boxed())
        .then("sync_address", |s| sync_address(s).boxed())
        .then("sync_connection", |s| sync_connection(s).boxed())
        .then("converge_ready", |s| converge_ready(s).boxed());

    let delete = Pipeline::<IpRangeState>::new("iprange-delete")
        .step(PollOperation::default())
        .then("load_address", |s| load_address(s).boxed())
        .then("load_connection", |s| load_connection(s).boxed())
        .then("identify_peering", |s| identify_peering(s).boxed())
        .then("compare", |s| compare(s).boxed())
        .then("sync_connection", |s| sync_connection(s).boxed())
        .then("sync_address", |s| sync_address(s).boxed())
        .step(RemoveFinalizer::default());

    Pipeline::<IpRangeState>::new("iprange")
        .then("validate_cidr", |s| validate_cidr(s).boxed())
        .step(AddFinalizer::default())
        .branch("deleting", |s: &IpRangeState| s.is_deleting(), delete, create)
}

/// Reconciles IpRange records of one cluster.
pub struct IpRangeReconciler {
    ctx: ControlContext,
    scope: Scope,
    store: Arc<dyn RecordStore<IpRange>>,
    pipeline: Pipeline<IpRangeState>,
}

impl IpRangeReconciler {
    pub fn new(ctx: ControlContext, scope: Scope, store: Arc<dyn RecordStore<IpRange>>) -> Self {
        Self {
            ctx,
            scope,
            store,
            pipeline: pipeline(),
        }
    }
}

#[async_trait]
impl Reconciler for IpRangeReconciler {
    async fn reconcile(&self, key: &str) -> Result<Flow> {
        let Some(record) = self.store.get(key).await? else {
            debug!("IpRange {} no longer exists", key);
            return Ok(Flow::Forget);
        };

        debug!("Reconciling IpRange {} ({})", key, record.meta.uid);
        let mut state =
            IpRangeState::new(self.ctx.clone(), self.scope.clone(), self.store.clone(), record);
        let flow = self.pipeline.run(&mut state).await?;
        Ok(if flow.is_continue() { Flow::Forget } else { flow })
    }
}
