//! RecordStore trait definition.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::Result;
use super::event::StoreEvent;
use crate::meta::Resource;

/// Get/patch-status/watch access to the records of one kind.
#[async_trait]
pub trait RecordStore<R: Resource>: Send + Sync {
    /// List all records, including those marked for deletion.
    async fn list(&self) -> Result<Vec<R>>;

    /// Get a record by name.
    async fn get(&self, name: &str) -> Result<Option<R>>;

    /// Create a record. Assigns uid, generation and resource version.
    async fn create(&self, record: R) -> Result<R>;

    /// Replace the spec and bump the generation.
    async fn update_spec(&self, name: &str, spec: R::Spec) -> Result<R>;

    /// Replace the whole status. Conditions are written exactly as given.
    async fn patch_status(&self, name: &str, status: R::Status) -> Result<R>;

    /// Add a finalizer. No-op if already present.
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<R>;

    /// Remove a finalizer.
    ///
    /// Returns `None` when this released a record already marked for
    /// deletion and the record is now gone.
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<Option<R>>;

    /// Mark a record for deletion.
    ///
    /// Records without finalizers are removed immediately and `None` is
    /// returned.
    async fn request_delete(&self, name: &str) -> Result<Option<R>>;

    /// Subscribe to change events for this kind.
    fn subscribe(&self) -> Result<broadcast::Receiver<StoreEvent>>;
}
