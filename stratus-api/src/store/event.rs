//! Events emitted by record changes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    /// The record was created or changed.
    Applied,
    /// The record is gone.
    Deleted,
}

/// Change notification dispatched to watchers via a broadcast channel.
///
/// Carries only the key; watchers re-read the record when they handle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub resource_type: &'static str,
    pub name: String,
}

impl StoreEvent {
    pub fn applied(resource_type: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind: StoreEventKind::Applied,
            resource_type,
            name: name.into(),
        }
    }

    pub fn deleted(resource_type: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind: StoreEventKind::Deleted,
            resource_type,
            name: name.into(),
        }
    }

    /// Name of the record this event refers to.
    pub fn resource_id(&self) -> &str {
        &self.name
    }
}
