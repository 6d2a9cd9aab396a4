//! Record metadata, lifecycle phase and the generic `Record` envelope.

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Finalizer marker kept on a record while its cloud resources may still exist.
pub const FINALIZER: &str = "cloud-control.stratus.io/deletion-hook";

/// Metadata shared by every record kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// True once deletion was requested; the record lingers until its finalizers are gone.
    pub fn is_marked_for_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns false if the finalizer was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns false if the finalizer was not present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

/// Lifecycle phase reported in a record's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    Unknown,
    Creating,
    SyncPrimary,
    SyncSecondary,
    Updating,
    Deleting,
    DeletePrimary,
    DeleteSecondary,
    Deleted,
    Ready,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Unknown => "Unknown",
            Phase::Creating => "Creating",
            Phase::SyncPrimary => "SyncPrimary",
            Phase::SyncSecondary => "SyncSecondary",
            Phase::Updating => "Updating",
            Phase::Deleting => "Deleting",
            Phase::DeletePrimary => "DeletePrimary",
            Phase::DeleteSecondary => "DeleteSecondary",
            Phase::Deleted => "Deleted",
            Phase::Ready => "Ready",
            Phase::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Provider sub-API an async operation belongs to. Selects the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Address,
    ServiceConnection,
    FilestoreInstance,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Address => write!(f, "address"),
            OperationKind::ServiceConnection => write!(f, "service-connection"),
            OperationKind::FilestoreInstance => write!(f, "filestore-instance"),
        }
    }
}

/// An outstanding provider operation. A status holds at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationHandle {
    pub id: String,
    pub kind: OperationKind,
}

impl OperationHandle {
    pub fn new(id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Implemented by every spec type; names the record kind.
pub trait ResourceSpec: Debug + Clone + PartialEq + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Status fields the shared pipeline steps read and write.
pub trait ResourceStatus: Debug + Clone + Default + PartialEq + Send + Sync + 'static {
    fn phase(&self) -> Phase;
    fn set_phase(&mut self, phase: Phase);
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn operation(&self) -> Option<&OperationHandle>;
    fn set_operation(&mut self, operation: Option<OperationHandle>);

    /// Id of the outstanding operation, empty when none.
    fn operation_id(&self) -> &str {
        self.operation().map(|op| op.id.as_str()).unwrap_or("")
    }
}

/// A declarative record: metadata, desired spec and observed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<S, T> {
    pub meta: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: T,
}

impl<S, T: Default> Record<S, T> {
    pub fn new(name: impl Into<String>, spec: S) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            spec,
            status: T::default(),
        }
    }
}

/// Generic view of a record used by stores and pipeline steps.
pub trait Resource: Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;
    type Spec: ResourceSpec;
    type Status: ResourceStatus;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn spec(&self) -> &Self::Spec;
    fn spec_mut(&mut self) -> &mut Self::Spec;
    fn status(&self) -> &Self::Status;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

impl<S, T> Resource for Record<S, T>
where
    S: ResourceSpec + Serialize + DeserializeOwned,
    T: ResourceStatus + Serialize + DeserializeOwned,
{
    const KIND: &'static str = S::KIND;
    type Spec = S;
    type Status = T;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn spec(&self) -> &S {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut S {
        &mut self.spec
    }

    fn status(&self) -> &T {
        &self.status
    }

    fn status_mut(&mut self) -> &mut T {
        &mut self.status
    }
}
