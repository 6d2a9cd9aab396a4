//! stratus-api: declarative records reconciled by stratus-control.
//!
//! A record is a `Record<Spec, Status>` owned by one remote cluster's
//! [`store::RecordStore`]. The spec is written by the admission path, the
//! status is written exclusively by the reconciliation pipeline.

pub mod condition;
pub mod iprange;
pub mod meta;
pub mod nfsinstance;
pub mod scope;
pub mod store;

pub use condition::{Condition, ConditionStatus, ConditionType, reason};
pub use iprange::{IpRange, IpRangePurpose, IpRangeSpec, IpRangeStatus, RemoteRef};
pub use meta::{
    FINALIZER, ObjectMeta, OperationHandle, OperationKind, Phase, Record, Resource, ResourceSpec,
    ResourceStatus,
};
pub use nfsinstance::{CapacityBand, FileTier, NfsInstance, NfsInstanceSpec, NfsInstanceStatus};
pub use scope::Scope;
pub use store::{MemoryStore, RecordStore, StoreError, StoreEvent, StoreEventKind};
