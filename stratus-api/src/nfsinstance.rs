//! NfsInstance: a managed file-storage instance placed on an IpRange.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{OperationHandle, Phase, Record, ResourceSpec, ResourceStatus};

pub type NfsInstance = Record<NfsInstanceSpec, NfsInstanceStatus>;

/// Service tier of a file instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileTier {
    BasicHdd,
    BasicSsd,
    Standard,
    Premium,
    HighScaleSsd,
    Zonal,
    Regional,
    Enterprise,
}

/// One allowed capacity band: `min..=max` in multiples of `step` above `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityBand {
    pub min: u64,
    pub max: u64,
    pub step: u64,
}

impl CapacityBand {
    const fn new(min: u64, max: u64, step: u64) -> Self {
        Self { min, max, step }
    }

    pub fn contains(&self, gb: u64) -> bool {
        gb >= self.min && gb <= self.max && (gb - self.min) % self.step == 0
    }
}

impl FileTier {
    /// Capacity bands in GiB accepted for this tier.
    pub fn capacity_bands(&self) -> &'static [CapacityBand] {
        const BASIC: &[CapacityBand] = &[CapacityBand::new(1024, 65400, 1)];
        const SSD: &[CapacityBand] = &[CapacityBand::new(2560, 65400, 1)];
        const HIGH_SCALE: &[CapacityBand] = &[CapacityBand::new(10240, 102400, 1)];
        const ZONAL: &[CapacityBand] = &[
            CapacityBand::new(1024, 9984, 256),
            CapacityBand::new(10240, 102400, 2560),
        ];
        const ENTERPRISE: &[CapacityBand] = &[CapacityBand::new(1024, 10240, 256)];

        match self {
            FileTier::BasicHdd | FileTier::Standard => BASIC,
            FileTier::BasicSsd | FileTier::Premium => SSD,
            FileTier::HighScaleSsd => HIGH_SCALE,
            FileTier::Zonal | FileTier::Regional => ZONAL,
            FileTier::Enterprise => ENTERPRISE,
        }
    }

    pub fn accepts_capacity(&self, gb: u64) -> bool {
        self.capacity_bands().iter().any(|band| band.contains(gb))
    }

    /// Basic tiers can grow but never shrink.
    pub fn is_basic(&self) -> bool {
        matches!(
            self,
            FileTier::BasicHdd | FileTier::BasicSsd | FileTier::Standard | FileTier::Premium
        )
    }
}

impl std::fmt::Display for FileTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileTier::BasicHdd => "BASIC_HDD",
            FileTier::BasicSsd => "BASIC_SSD",
            FileTier::Standard => "STANDARD",
            FileTier::Premium => "PREMIUM",
            FileTier::HighScaleSsd => "HIGH_SCALE_SSD",
            FileTier::Zonal => "ZONAL",
            FileTier::Regional => "REGIONAL",
            FileTier::Enterprise => "ENTERPRISE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsInstanceSpec {
    /// Name of the IpRange record the instance is placed on.
    pub ip_range: String,
    pub tier: FileTier,
    pub capacity_gb: u64,
    pub file_share_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_backup: Option<String>,
}

impl ResourceSpec for NfsInstanceSpec {
    const KIND: &'static str = "NfsInstance";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsInstanceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationHandle>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub capacity_gb: u64,
}

impl ResourceStatus for NfsInstanceStatus {
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

impl NfsInstance {
    pub fn canonical_instance_name(&self) -> String {
        format!("cm-{}", self.meta.uid)
    }

    pub fn legacy_instance_name(&self) -> &str {
        &self.meta.name
    }
}
