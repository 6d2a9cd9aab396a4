//! Record storage.
//!
//! [`RecordStore`] is the get/patch-status/watch surface the reconcilers work
//! against. [`MemoryStore`] backs a single remote cluster in the binary and in
//! tests.

mod error;
mod event;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use event::{StoreEvent, StoreEventKind};
pub use memory::MemoryStore;
pub use traits::RecordStore;
