//! stratus-control: provisions provider infrastructure for many remote clusters.
//!
//! The [`looper::Looper`] dispatches each active cluster to a fresh
//! [`runner::Runner`], which starts one controller per resource kind. A
//! controller drives records through its kind's [`composed::Pipeline`]:
//! validate, finalize, poll the pending operation, load, diff, mutate and
//! converge the status.

pub mod composed;
pub mod config;
pub mod connection;
pub mod context;
pub mod controller;
pub mod diff;
pub mod error;
pub mod kinds;
pub mod looper;
pub mod manager;
pub mod poller;
pub mod provider;
pub mod runner;

pub use config::ControlConfig;
pub use connection::{ClusterConnection, ConnectionFactory, StaticConnectionFactory};
pub use context::ControlContext;
pub use error::{ControlError, ProviderError, Result};
pub use looper::{ClusterMembership, Looper};
pub use runner::{ResourceKind, RunOptions, Runner, default_kinds};
