//! Remote cluster connections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stratus_api::{IpRange, NfsInstance, RecordStore, Scope};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ControlError, Result};

/// Everything a runner needs to reconcile one remote cluster.
#[derive(Clone)]
pub struct ClusterConnection {
    pub cluster_id: String,
    pub scope: Scope,
    pub ip_ranges: Arc<dyn RecordStore<IpRange>>,
    pub nfs_instances: Arc<dyn RecordStore<NfsInstance>>,
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("cluster_id", &self.cluster_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Resolves a cluster id to a usable connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn build(&self, cluster_id: &str) -> Result<ClusterConnection>;
}

/// Factory over connections registered up front.
#[derive(Default)]
pub struct StaticConnectionFactory {
    connections: RwLock<HashMap<String, ClusterConnection>>,
}

impl StaticConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: ClusterConnection) {
        debug!("Registering connection for cluster {}", connection.cluster_id);
        self.connections
            .write()
            .await
            .insert(connection.cluster_id.clone(), connection);
    }

    pub async fn unregister(&self, cluster_id: &str) -> bool {
        self.connections.write().await.remove(cluster_id).is_some()
    }
}

#[async_trait]
impl ConnectionFactory for StaticConnectionFactory {
    async fn build(&self, cluster_id: &str) -> Result<ClusterConnection> {
        self.connections
            .read()
            .await
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| ControlError::ConnectionBuild {
                cluster: cluster_id.to_string(),
                message: "no credentials registered".to_string(),
            })
    }
}
