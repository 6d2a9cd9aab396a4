//! Status conditions attached to records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition reasons used by the reconcilers.
pub mod reason {
    pub const READY: &str = "Ready";
    pub const INVALID_CIDR: &str = "InvalidCidr";
    pub const CIDR_CAN_NOT_BE_CHANGED: &str = "CidrCanNotBeChanged";
    pub const PROVIDER_ERROR: &str = "ProviderError";
    pub const ADDRESS_MISMATCH: &str = "AddressMismatch";
    pub const WRONG_NETWORK: &str = "WrongNetwork";
    pub const TIER_INVALID: &str = "TierInvalid";
    pub const CAPACITY_INVALID: &str = "CapacityInvalid";
    pub const CAPACITY_SCALE_DOWN: &str = "CapacityScaleDown";
    pub const IP_RANGE_NOT_READY: &str = "IpRangeNotReady";
    pub const INSTANCE_ERROR: &str = "InstanceError";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Error,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::Error => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A typed status fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn ready(message: impl Into<String>) -> Self {
        Self::new(
            ConditionType::Ready,
            ConditionStatus::True,
            reason::READY,
            message,
        )
    }

    pub fn error(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Error, ConditionStatus::True, reason, message)
    }

    /// Same type, status, reason and message; transition time is ignored.
    pub fn same_fact(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }

    /// Replaces the whole list with `condition`.
    ///
    /// Keeps the previous transition time when the fact did not change, so a
    /// repeated exclusive set leaves the list equal.
    pub fn set_exclusive(conditions: &mut Vec<Condition>, condition: Condition) {
        let unchanged = conditions.len() == 1 && conditions[0].same_fact(&condition);
        if unchanged {
            return;
        }
        conditions.clear();
        conditions.push(condition);
    }

    /// Removes conditions of `type_` carrying `reason`. Returns true if any were removed.
    pub fn remove_if_reason(
        conditions: &mut Vec<Condition>,
        type_: ConditionType,
        reason: &str,
    ) -> bool {
        let before = conditions.len();
        conditions.retain(|c| !(c.type_ == type_ && c.reason == reason));
        before != conditions.len()
    }

    pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
        conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(conditions: &[Condition], type_: ConditionType) -> bool {
        Self::find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
    }
}
