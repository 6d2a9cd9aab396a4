//! In-memory RecordStore with broadcast watch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;
use uuid::Uuid;

use super::error::{Result, StoreError};
use super::event::StoreEvent;
use super::traits::RecordStore;
use crate::meta::Resource;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Records of one kind held in a map keyed by name.
pub struct MemoryStore<R: Resource> {
    records: RwLock<BTreeMap<String, R>>,
    events: broadcast::Sender<StoreEvent>,
    version: AtomicU64,
    closed: AtomicBool,
}

impl<R: Resource> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> MemoryStore<R> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            events,
            version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Reject all further requests and subscriptions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: StoreEvent) {
        debug!(
            kind = event.resource_type,
            record = %event.name,
            event = ?event.kind,
            "store event"
        );
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Applies `f` to the named record, bumps its version and emits an Applied event.
    async fn modify<F>(&self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut R) + Send,
    {
        self.ensure_open()?;
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", R::KIND, name)))?;
        f(record);
        record.meta_mut().resource_version = self.next_version();
        let updated = record.clone();
        drop(records);

        self.emit(StoreEvent::applied(R::KIND, name));
        Ok(updated)
    }

    async fn remove(&self, name: &str) {
        self.records.write().await.remove(name);
        self.emit(StoreEvent::deleted(R::KIND, name));
    }
}

#[async_trait]
impl<R: Resource> RecordStore<R> for MemoryStore<R> {
    async fn list(&self) -> Result<Vec<R>> {
        self.ensure_open()?;
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<R>> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn create(&self, mut record: R) -> Result<R> {
        self.ensure_open()?;
        let name = record.name().to_string();
        if name.is_empty() {
            return Err(StoreError::Internal("record name must not be empty".into()));
        }

        let mut records = self.records.write().await;
        if records.contains_key(&name) {
            return Err(StoreError::Conflict(format!(
                "{} {} already exists",
                R::KIND,
                name
            )));
        }

        let meta = record.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        meta.generation = 1;
        meta.resource_version = self.next_version();
        meta.deletion_timestamp = None;
        records.insert(name.clone(), record.clone());
        drop(records);

        self.emit(StoreEvent::applied(R::KIND, name));
        Ok(record)
    }

    async fn update_spec(&self, name: &str, spec: R::Spec) -> Result<R> {
        self.modify(name, move |record| {
            if *record.spec() != spec {
                *record.spec_mut() = spec;
                record.meta_mut().generation += 1;
            }
        })
        .await
    }

    async fn patch_status(&self, name: &str, status: R::Status) -> Result<R> {
        self.modify(name, move |record| *record.status_mut() = status)
            .await
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<R> {
        self.modify(name, |record| {
            record.meta_mut().add_finalizer(finalizer);
        })
        .await
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<Option<R>> {
        let updated = self
            .modify(name, |record| {
                record.meta_mut().remove_finalizer(finalizer);
            })
            .await?;

        let meta = updated.meta();
        if meta.is_marked_for_deletion() && meta.finalizers.is_empty() {
            self.remove(name).await;
            return Ok(None);
        }
        Ok(Some(updated))
    }

    async fn request_delete(&self, name: &str) -> Result<Option<R>> {
        let updated = self
            .modify(name, |record| {
                let meta = record.meta_mut();
                if meta.deletion_timestamp.is_none() {
                    meta.deletion_timestamp = Some(Utc::now());
                }
            })
            .await?;

        if updated.meta().finalizers.is_empty() {
            self.remove(name).await;
            return Ok(None);
        }
        Ok(Some(updated))
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<StoreEvent>> {
        self.ensure_open()?;
        Ok(self.events.subscribe())
    }
}
