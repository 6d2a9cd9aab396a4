//! Per-kind reconciliation pipelines.

pub mod iprange;
pub mod nfsinstance;

pub use iprange::{IpRangeReconciler, IpRangeState};
pub use nfsinstance::{NfsInstanceReconciler, NfsInstanceState};
