//! In-memory provider used by the binary and the test-suite.
//!
//! Mutating calls return an operation id right away; the change itself is
//! applied when the operation is polled to completion.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{
    Address, AddressApi, FilestoreApi, FilestoreInstance, InstanceState, OperationStatus,
    ProjectApi, ProviderResult, SERVICE_NETWORKING, ServiceConnection, ServiceNetworkingApi,
};
use crate::error::ProviderError;

/// A mutating call seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub method: &'static str,
    pub target: String,
}

type AddressKey = (String, String);
type ConnectionKey = (String, String);
type InstanceKey = (String, String, String);

#[derive(Debug, Clone)]
enum Effect {
    PutAddress(AddressKey, Address),
    RemoveAddress(AddressKey),
    PutConnection(ConnectionKey, ServiceConnection),
    RemoveConnection(ConnectionKey),
    PutInstance(InstanceKey, FilestoreInstance),
    RemoveInstance(InstanceKey),
    Nothing,
}

#[derive(Debug)]
struct SimOperation {
    remaining_polls: u32,
    effect: Effect,
    /// Applied instead of `effect` when the operation fails.
    rollback: Effect,
    failure: Option<String>,
    finished: bool,
}

#[derive(Default)]
struct SimState {
    addresses: HashMap<AddressKey, Address>,
    connections: HashMap<ConnectionKey, ServiceConnection>,
    instances: HashMap<InstanceKey, FilestoreInstance>,
    operations: HashMap<String, SimOperation>,
    project_numbers: HashMap<String, u64>,
    project_lookups: usize,
    polls_until_done: u32,
    call_delay: Duration,
    next_operation_failure: Option<String>,
    injected: HashMap<&'static str, VecDeque<ProviderError>>,
    calls: Vec<SimCall>,
}

/// Simulated provider implementing every provider sub-API.
pub struct SimProvider {
    state: Mutex<SimState>,
}

impl Default for SimProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                polls_until_done: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of polls an operation reports running before it is done.
    pub fn set_polls_until_done(&self, polls: u32) {
        self.state().polls_until_done = polls;
    }

    /// Delay applied to every call, used to provoke API timeouts.
    pub fn set_call_delay(&self, delay: Duration) {
        self.state().call_delay = delay;
    }

    /// The next operation created finishes with `message` and changes nothing.
    pub fn fail_next_operation(&self, message: impl Into<String>) {
        self.state().next_operation_failure = Some(message.into());
    }

    /// The next call of `method` fails with `error`.
    pub fn fail_next_call(&self, method: &'static str, error: ProviderError) {
        self.state()
            .injected
            .entry(method)
            .or_default()
            .push_back(error);
    }

    pub fn set_project_number(&self, project: &str, number: u64) {
        self.state()
            .project_numbers
            .insert(project.to_string(), number);
    }

    pub fn project_lookups(&self) -> usize {
        self.state().project_lookups
    }

    /// Mutating calls in the order they were made.
    pub fn mutations(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    pub fn clear_mutations(&self) {
        self.state().calls.clear();
    }

    pub fn put_address(&self, project: &str, address: Address) {
        self.state()
            .addresses
            .insert((project.to_string(), address.name.clone()), address);
    }

    pub fn address(&self, project: &str, name: &str) -> Option<Address> {
        self.state()
            .addresses
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put_connection(&self, project: &str, connection: ServiceConnection) {
        self.state().connections.insert(
            (project.to_string(), connection.network.clone()),
            connection,
        );
    }

    pub fn connection(&self, project: &str, network: &str) -> Option<ServiceConnection> {
        self.state()
            .connections
            .get(&(project.to_string(), network.to_string()))
            .cloned()
    }

    pub fn put_instance(&self, project: &str, location: &str, instance: FilestoreInstance) {
        self.state().instances.insert(
            (
                project.to_string(),
                location.to_string(),
                instance.name.clone(),
            ),
            instance,
        );
    }

    pub fn instance(&self, project: &str, location: &str, name: &str) -> Option<FilestoreInstance> {
        self.state()
            .instances
            .get(&(project.to_string(), location.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pending_operations(&self) -> usize {
        self.state()
            .operations
            .values()
            .filter(|op| !op.finished)
            .count()
    }

    /// Sleeps for the configured delay, then pops an injected failure for `method`.
    async fn enter(&self, method: &'static str) -> ProviderResult<()> {
        let delay = self.state().call_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self
            .state()
            .injected
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start_operation(
        state: &mut SimState,
        method: &'static str,
        target: String,
        effect: Effect,
        rollback: Effect,
    ) -> String {
        let id = format!("operation-{}", Uuid::new_v4());
        debug!("sim: {} {} -> {}", method, target, id);
        state.calls.push(SimCall { method, target });
        let failure = state.next_operation_failure.take();
        state.operations.insert(
            id.clone(),
            SimOperation {
                remaining_polls: state.polls_until_done,
                effect,
                rollback,
                failure,
                finished: false,
            },
        );
        id
    }

    fn apply(state: &mut SimState, effect: Effect) {
        match effect {
            Effect::PutAddress(key, address) => {
                state.addresses.insert(key, address);
            }
            Effect::RemoveAddress(key) => {
                state.addresses.remove(&key);
            }
            Effect::PutConnection(key, connection) => {
                state.connections.insert(key, connection);
            }
            Effect::RemoveConnection(key) => {
                state.connections.remove(&key);
            }
            Effect::PutInstance(key, instance) => {
                state.instances.insert(key, instance);
            }
            Effect::RemoveInstance(key) => {
                state.instances.remove(&key);
            }
            Effect::Nothing => {}
        }
    }

    fn poll_operation(&self, operation: &str) -> ProviderResult<OperationStatus> {
        let mut state = self.state();
        let op = state
            .operations
            .get_mut(operation)
            .ok_or_else(|| ProviderError::NotFound(format!("operation {}", operation)))?;

        if op.remaining_polls > 0 {
            op.remaining_polls -= 1;
            return Ok(OperationStatus::running());
        }

        let failure = op.failure.clone();
        if !op.finished {
            op.finished = true;
            let effect = if failure.is_some() {
                std::mem::replace(&mut op.rollback, Effect::Nothing)
            } else {
                std::mem::replace(&mut op.effect, Effect::Nothing)
            };
            Self::apply(&mut state, effect);
        }

        Ok(match failure {
            Some(message) => OperationStatus::failed(message),
            None => OperationStatus::done(),
        })
    }

    fn ready_instance(mut instance: FilestoreInstance) -> FilestoreInstance {
        instance.state = InstanceState::Ready;
        if instance.ip_addresses.is_empty()
            && let Some(host) = first_host(&instance.reserved_ip_range)
        {
            instance.ip_addresses = vec![host];
        }
        instance
    }
}

/// First usable host of a cidr, e.g. `10.0.0.0/24` gives `10.0.0.2`.
fn first_host(cidr: &str) -> Option<String> {
    let net: ipnet::Ipv4Net = cidr.parse().ok()?;
    let base = u32::from(net.network());
    Some(std::net::Ipv4Addr::from(base.checked_add(2)?).to_string())
}

#[async_trait]
impl AddressApi for SimProvider {
    async fn get_address(&self, project: &str, name: &str) -> ProviderResult<Address> {
        self.enter("get_address").await?;
        self.address(project, name)
            .ok_or_else(|| ProviderError::NotFound(format!("address {}", name)))
    }

    async fn list_addresses(&self, project: &str, network: &str) -> ProviderResult<Vec<Address>> {
        self.enter("list_addresses").await?;
        let state = self.state();
        let mut addresses: Vec<Address> = state
            .addresses
            .iter()
            .filter(|((p, _), a)| p == project && a.network == network)
            .map(|(_, a)| a.clone())
            .collect();
        addresses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(addresses)
    }

    async fn insert_address(&self, project: &str, address: Address) -> ProviderResult<String> {
        self.enter("insert_address").await?;
        let mut state = self.state();
        let key = (project.to_string(), address.name.clone());
        if state.addresses.contains_key(&key) {
            let message = format!("address {} already exists", address.name);
            return Err(ProviderError::api(409, message));
        }
        let target = address.name.clone();
        Ok(Self::start_operation(
            &mut state,
            "insert_address",
            target,
            Effect::PutAddress(key, address),
            Effect::Nothing,
        ))
    }

    async fn delete_address(&self, project: &str, name: &str) -> ProviderResult<String> {
        self.enter("delete_address").await?;
        let mut state = self.state();
        let key = (project.to_string(), name.to_string());
        if !state.addresses.contains_key(&key) {
            return Err(ProviderError::NotFound(format!("address {}", name)));
        }
        Ok(Self::start_operation(
            &mut state,
            "delete_address",
            name.to_string(),
            Effect::RemoveAddress(key),
            Effect::Nothing,
        ))
    }

    async fn get_operation(
        &self,
        _project: &str,
        operation: &str,
    ) -> ProviderResult<OperationStatus> {
        self.enter("get_address_operation").await?;
        self.poll_operation(operation)
    }
}

#[async_trait]
impl ServiceNetworkingApi for SimProvider {
    async fn list_connections(
        &self,
        project: &str,
        network: &str,
    ) -> ProviderResult<Vec<ServiceConnection>> {
        self.enter("list_connections").await?;
        Ok(self.connection(project, network).into_iter().collect())
    }

    async fn create_connection(
        &self,
        project: &str,
        network: &str,
        ranges: Vec<String>,
    ) -> ProviderResult<String> {
        self.enter("create_connection").await?;
        let mut state = self.state();
        let key = (project.to_string(), network.to_string());
        if state.connections.contains_key(&key) {
            return Err(ProviderError::api(409, "connection already exists"));
        }
        let connection = ServiceConnection {
            network: network.to_string(),
            service: SERVICE_NETWORKING.to_string(),
            reserved_peering_ranges: ranges.clone(),
        };
        Ok(Self::start_operation(
            &mut state,
            "create_connection",
            ranges.join(","),
            Effect::PutConnection(key, connection),
            Effect::Nothing,
        ))
    }

    async fn patch_connection(
        &self,
        project: &str,
        network: &str,
        ranges: Vec<String>,
    ) -> ProviderResult<String> {
        self.enter("patch_connection").await?;
        let mut state = self.state();
        let key = (project.to_string(), network.to_string());
        let Some(existing) = state.connections.get(&key) else {
            return Err(ProviderError::NotFound(format!("connection {}", network)));
        };
        let connection = ServiceConnection {
            reserved_peering_ranges: ranges.clone(),
            ..existing.clone()
        };
        Ok(Self::start_operation(
            &mut state,
            "patch_connection",
            ranges.join(","),
            Effect::PutConnection(key, connection),
            Effect::Nothing,
        ))
    }

    async fn delete_connection(
        &self,
        project_number: u64,
        network: &str,
    ) -> ProviderResult<String> {
        self.enter("delete_connection").await?;
        let mut state = self.state();
        let project = state
            .project_numbers
            .iter()
            .find(|(_, n)| **n == project_number)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| {
                ProviderError::NotFound(format!("project number {}", project_number))
            })?;
        let key = (project, network.to_string());
        if !state.connections.contains_key(&key) {
            return Err(ProviderError::NotFound(format!("connection {}", network)));
        }
        Ok(Self::start_operation(
            &mut state,
            "delete_connection",
            network.to_string(),
            Effect::RemoveConnection(key),
            Effect::Nothing,
        ))
    }

    async fn get_operation(&self, operation: &str) -> ProviderResult<OperationStatus> {
        self.enter("get_connection_operation").await?;
        self.poll_operation(operation)
    }
}

#[async_trait]
impl FilestoreApi for SimProvider {
    async fn get_instance(
        &self,
        project: &str,
        location: &str,
        name: &str,
    ) -> ProviderResult<FilestoreInstance> {
        self.enter("get_instance").await?;
        self.instance(project, location, name)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", name)))
    }

    async fn create_instance(
        &self,
        project: &str,
        location: &str,
        instance: FilestoreInstance,
    ) -> ProviderResult<String> {
        self.enter("create_instance").await?;
        let mut state = self.state();
        let key = (
            project.to_string(),
            location.to_string(),
            instance.name.clone(),
        );
        if state.instances.contains_key(&key) {
            let message = format!("instance {} already exists", instance.name);
            return Err(ProviderError::api(409, message));
        }

        let creating = FilestoreInstance {
            state: InstanceState::Creating,
            ip_addresses: Vec::new(),
            ..instance.clone()
        };
        state.instances.insert(key.clone(), creating);
        Ok(Self::start_operation(
            &mut state,
            "create_instance",
            instance.name.clone(),
            Effect::PutInstance(key.clone(), Self::ready_instance(instance)),
            Effect::RemoveInstance(key),
        ))
    }

    async fn patch_instance(
        &self,
        project: &str,
        location: &str,
        instance: FilestoreInstance,
        update_mask: &[&str],
    ) -> ProviderResult<String> {
        self.enter("patch_instance").await?;
        let mut state = self.state();
        let key = (
            project.to_string(),
            location.to_string(),
            instance.name.clone(),
        );
        let Some(existing) = state.instances.get(&key) else {
            return Err(ProviderError::NotFound(format!("instance {}", instance.name)));
        };

        let mut patched = existing.clone();
        for field in update_mask {
            if *field == "fileShares" {
                patched.capacity_gb = instance.capacity_gb;
                patched.file_share_name = instance.file_share_name.clone();
            }
        }
        Ok(Self::start_operation(
            &mut state,
            "patch_instance",
            instance.name.clone(),
            Effect::PutInstance(key, patched),
            Effect::Nothing,
        ))
    }

    async fn delete_instance(
        &self,
        project: &str,
        location: &str,
        name: &str,
    ) -> ProviderResult<String> {
        self.enter("delete_instance").await?;
        let mut state = self.state();
        let key = (project.to_string(), location.to_string(), name.to_string());
        let Some(existing) = state.instances.get_mut(&key) else {
            return Err(ProviderError::NotFound(format!("instance {}", name)));
        };
        existing.state = InstanceState::Deleting;
        Ok(Self::start_operation(
            &mut state,
            "delete_instance",
            name.to_string(),
            Effect::RemoveInstance(key),
            Effect::Nothing,
        ))
    }

    async fn get_operation(&self, operation: &str) -> ProviderResult<OperationStatus> {
        self.enter("get_instance_operation").await?;
        self.poll_operation(operation)
    }
}

#[async_trait]
impl ProjectApi for SimProvider {
    async fn project_number(&self, project: &str) -> ProviderResult<u64> {
        self.enter("project_number").await?;
        let mut state = self.state();
        state.project_lookups += 1;
        state
            .project_numbers
            .get(project)
            .copied()
            .ok_or_else(|| ProviderError::NotFound(format!("project {}", project)))
    }
}
