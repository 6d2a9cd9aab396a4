//! IpRange: a reserved private address range, optionally peered for private service access.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{OperationHandle, Phase, Record, ResourceSpec, ResourceStatus};

pub type IpRange = Record<IpRangeSpec, IpRangeStatus>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpRangePurpose {
    /// Private service access: the range is also listed on the service networking connection.
    #[default]
    #[serde(rename = "PSA")]
    Psa,
    /// Private service connect: address only.
    #[serde(rename = "PSC")]
    Psc,
}

/// Name the range was known by in the remote cluster before canonical naming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRangeSpec {
    pub cidr: String,
    #[serde(default)]
    pub purpose: IpRangePurpose,
    #[serde(default)]
    pub remote_ref: RemoteRef,
}

impl IpRangeSpec {
    pub fn new(cidr: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            purpose: IpRangePurpose::Psa,
            remote_ref: RemoteRef::default(),
        }
    }
}

impl ResourceSpec for IpRangeSpec {
    const KIND: &'static str = "IpRange";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRangeStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationHandle>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Cidr actually reserved at the provider; empty until first Ready.
    #[serde(default)]
    pub cidr: String,
    #[serde(default)]
    pub address_name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub prefix: u8,
}

impl ResourceStatus for IpRangeStatus {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }

    fn operation(&self) -> Option<&OperationHandle> {
        self.operation.as_ref()
    }

    fn set_operation(&mut self, operation: Option<OperationHandle>) {
        self.operation = operation;
    }
}

impl IpRange {
    /// Provider name derived from the record uid.
    pub fn canonical_address_name(&self) -> String {
        format!("cm-{}", self.meta.uid)
    }

    /// Name used by ranges created before canonical naming, if any.
    pub fn legacy_address_name(&self) -> Option<&str> {
        let name = self.spec.remote_ref.name.as_str();
        (!name.is_empty()).then_some(name)
    }
}
