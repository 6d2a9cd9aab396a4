//! Provider API surface consumed by the reconcilers.
//!
//! Each sub-API is a trait so the binary and the tests can run against
//! [`sim::SimProvider`]. Reconcilers never call a trait directly; they go
//! through [`Providers::call`], which bounds every call by the API timeout.

pub mod cache;
pub mod sim;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_api::FileTier;

use crate::error::ProviderError;

pub use cache::ProjectNumberCache;
pub use sim::SimProvider;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Service networking peering service used for private service access.
pub const SERVICE_NETWORKING: &str = "servicenetworking.googleapis.com";

/// Update mask sent when patching a file instance.
pub const FILE_SHARES_MASK: &[&str] = &["fileShares"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressPurpose {
    VpcPeering,
    PrivateServiceConnect,
}

/// A reserved global internal address range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub name: String,
    pub address: String,
    pub prefix_length: u8,
    /// Full network path the range is reserved in.
    pub network: String,
    pub purpose: AddressPurpose,
}

/// A private service access peering connection of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConnection {
    pub network: String,
    pub service: String,
    /// Names of the addresses the peering may allocate from.
    pub reserved_peering_ranges: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Creating,
    Ready,
    Repairing,
    Deleting,
    Restoring,
    Suspended,
    Error,
}

/// A managed file-storage instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilestoreInstance {
    pub name: String,
    pub tier: FileTier,
    pub state: InstanceState,
    pub capacity_gb: u64,
    pub file_share_name: String,
    pub network: String,
    pub reserved_ip_range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_backup: Option<String>,
    /// Mount addresses, filled once the instance is ready.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// Result of reading an async provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub done: bool,
    /// Error payload of a finished operation.
    pub error: Option<String>,
}

impl OperationStatus {
    pub fn running() -> Self {
        Self {
            done: false,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            done: true,
            error: Some(message.into()),
        }
    }
}

/// Global address API.
#[async_trait]
pub trait AddressApi: Send + Sync {
    async fn get_address(&self, project: &str, name: &str) -> ProviderResult<Address>;

    /// List addresses reserved in `network` (full path).
    async fn list_addresses(&self, project: &str, network: &str) -> ProviderResult<Vec<Address>>;

    /// Reserve an address. Returns the operation id.
    async fn insert_address(&self, project: &str, address: Address) -> ProviderResult<String>;

    /// Release an address. Returns the operation id.
    async fn delete_address(&self, project: &str, name: &str) -> ProviderResult<String>;

    async fn get_operation(&self, project: &str, operation: &str)
    -> ProviderResult<OperationStatus>;
}

/// Private service access peering API.
#[async_trait]
pub trait ServiceNetworkingApi: Send + Sync {
    async fn list_connections(
        &self,
        project: &str,
        network: &str,
    ) -> ProviderResult<Vec<ServiceConnection>>;

    async fn create_connection(
        &self,
        project: &str,
        network: &str,
        ranges: Vec<String>,
    ) -> ProviderResult<String>;

    async fn patch_connection(
        &self,
        project: &str,
        network: &str,
        ranges: Vec<String>,
    ) -> ProviderResult<String>;

    /// The peering service addresses the consumer network by project number.
    async fn delete_connection(&self, project_number: u64, network: &str)
    -> ProviderResult<String>;

    async fn get_operation(&self, operation: &str) -> ProviderResult<OperationStatus>;
}

/// Managed file instance API.
#[async_trait]
pub trait FilestoreApi: Send + Sync {
    async fn get_instance(
        &self,
        project: &str,
        location: &str,
        name: &str,
    ) -> ProviderResult<FilestoreInstance>;

    async fn create_instance(
        &self,
        project: &str,
        location: &str,
        instance: FilestoreInstance,
    ) -> ProviderResult<String>;

    async fn patch_instance(
        &self,
        project: &str,
        location: &str,
        instance: FilestoreInstance,
        update_mask: &[&str],
    ) -> ProviderResult<String>;

    async fn delete_instance(
        &self,
        project: &str,
        location: &str,
        name: &str,
    ) -> ProviderResult<String>;

    async fn get_operation(&self, operation: &str) -> ProviderResult<OperationStatus>;
}

/// Project metadata API.
#[async_trait]
pub trait ProjectApi: Send + Sync {
    async fn project_number(&self, project: &str) -> ProviderResult<u64>;
}

/// The provider sub-APIs plus the per-call timeout.
#[derive(Clone)]
pub struct Providers {
    pub address: Arc<dyn AddressApi>,
    pub networking: Arc<dyn ServiceNetworkingApi>,
    pub filestore: Arc<dyn FilestoreApi>,
    pub projects: Arc<dyn ProjectApi>,
    pub api_timeout: Duration,
}

impl Providers {
    /// All sub-APIs served by one simulated provider.
    pub fn simulated(sim: Arc<SimProvider>, api_timeout: Duration) -> Self {
        Self {
            address: sim.clone(),
            networking: sim.clone(),
            filestore: sim.clone(),
            projects: sim,
            api_timeout,
        }
    }

    /// Await a provider call, failing with [`ProviderError::Timeout`] past the API timeout.
    pub async fn call<T, F>(&self, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        with_timeout(self.api_timeout, fut).await
    }
}

pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(limit)),
    }
}
