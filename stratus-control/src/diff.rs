//! State-diff engine.
//!
//! Pure functions from (desired spec, loaded snapshots, deletion flag) to the
//! operation each sub-resource needs and the overall phase. Nothing here
//! talks to the provider or the store.

use std::collections::BTreeSet;

use stratus_api::{IpRangePurpose, Phase};

use crate::provider::{Address, FilestoreInstance, ServiceConnection};

/// What a sub-resource needs to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    None,
    Add,
    Modify,
    Delete,
}

impl DiffOp {
    pub fn is_none(&self) -> bool {
        matches!(self, DiffOp::None)
    }
}

/// Classify a primary sub-resource.
///
/// `matches` is only consulted when the resource exists and is not being deleted.
pub fn classify_primary<T>(
    actual: Option<&T>,
    deleting: bool,
    matches: impl FnOnce(&T) -> bool,
) -> DiffOp {
    match (actual, deleting) {
        (None, false) => DiffOp::Add,
        (None, true) => DiffOp::None,
        (Some(_), true) => DiffOp::Delete,
        (Some(actual), false) if matches(actual) => DiffOp::None,
        (Some(_), false) => DiffOp::Modify,
    }
}

/// Classify a reference-list secondary against its computed target set.
///
/// Order and duplicates in either list are ignored.
pub fn classify_secondary(actual: Option<&[String]>, target: &[String]) -> DiffOp {
    match actual {
        None if target.is_empty() => DiffOp::None,
        None => DiffOp::Add,
        Some(_) if target.is_empty() => DiffOp::Delete,
        Some(current) => {
            let current: BTreeSet<&String> = current.iter().collect();
            let target: BTreeSet<&String> = target.iter().collect();
            if current == target {
                DiffOp::None
            } else {
                DiffOp::Modify
            }
        }
    }
}

/// Phase for a primary/secondary pair.
///
/// Create and update work the primary first, deletion releases the secondary first.
pub fn overall_phase(primary: DiffOp, secondary: DiffOp, deleting: bool) -> Phase {
    if deleting {
        if !secondary.is_none() {
            Phase::DeleteSecondary
        } else if !primary.is_none() {
            Phase::DeletePrimary
        } else {
            Phase::Deleted
        }
    } else if !primary.is_none() {
        Phase::SyncPrimary
    } else if !secondary.is_none() {
        Phase::SyncSecondary
    } else {
        Phase::Ready
    }
}

/// Reference set the peering connection should carry.
///
/// Keeps every current range that still names an existing peering address
/// other than `own`, then adds `own` unless deleting.
pub fn peering_target(
    current: &[String],
    peering_addresses: &[String],
    own: &str,
    deleting: bool,
) -> Vec<String> {
    let mut target: Vec<String> = current
        .iter()
        .filter(|name| name.as_str() != own && peering_addresses.contains(name))
        .cloned()
        .collect();
    if !deleting {
        target.push(own.to_string());
    }
    target.sort();
    target.dedup();
    target
}

/// The address an IpRange should hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTarget {
    pub address: String,
    pub prefix: u8,
    pub network: String,
}

impl AddressTarget {
    pub fn matches(&self, actual: &Address) -> bool {
        actual.address == self.address
            && actual.prefix_length == self.prefix
            && actual.network == self.network
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRangeDiff {
    pub address: DiffOp,
    pub connection: DiffOp,
    pub phase: Phase,
}

/// Diff an IpRange: the address is primary, the peering connection secondary (PSA only).
pub fn diff_ip_range(
    target: Option<&AddressTarget>,
    address: Option<&Address>,
    connection: Option<&ServiceConnection>,
    peering: &[String],
    purpose: IpRangePurpose,
    deleting: bool,
) -> IpRangeDiff {
    let address_op = classify_primary(address, deleting, |actual| {
        target.is_some_and(|t| t.matches(actual))
    });
    let connection_op = match purpose {
        IpRangePurpose::Psa => classify_secondary(
            connection.map(|c| c.reserved_peering_ranges.as_slice()),
            peering,
        ),
        IpRangePurpose::Psc => DiffOp::None,
    };

    IpRangeDiff {
        address: address_op,
        connection: connection_op,
        phase: overall_phase(address_op, connection_op, deleting),
    }
}

/// Fields of a file instance that are compared and patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub capacity_gb: u64,
    pub file_share_name: String,
}

impl InstanceTarget {
    pub fn matches(&self, actual: &FilestoreInstance) -> bool {
        actual.capacity_gb == self.capacity_gb && actual.file_share_name == self.file_share_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsInstanceDiff {
    pub instance: DiffOp,
    pub phase: Phase,
}

pub fn diff_nfs_instance(
    target: &InstanceTarget,
    actual: Option<&FilestoreInstance>,
    deleting: bool,
) -> NfsInstanceDiff {
    let op = classify_primary(actual, deleting, |actual| target.matches(actual));
    let phase = match op {
        DiffOp::Add => Phase::Creating,
        DiffOp::Modify => Phase::Updating,
        DiffOp::Delete => Phase::Deleting,
        DiffOp::None if deleting => Phase::Deleted,
        DiffOp::None => Phase::Ready,
    };
    NfsInstanceDiff { instance: op, phase }
}
