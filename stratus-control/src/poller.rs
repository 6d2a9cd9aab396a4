//! Operation poller: asks the provider whether a persisted operation finished.

use stratus_api::{OperationHandle, OperationKind, Scope};
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{OperationStatus, Providers};

/// Outcome of polling one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Running,
    Done,
    Failed(String),
    /// The provider no longer knows the operation; nothing left to track.
    NotFound,
}

/// Routes a poll to the sub-API recorded in the handle's kind.
#[derive(Clone)]
pub struct OperationPoller {
    providers: Providers,
}

impl OperationPoller {
    pub fn new(providers: Providers) -> Self {
        Self { providers }
    }

    pub async fn poll(
        &self,
        scope: &Scope,
        handle: &OperationHandle,
    ) -> Result<PollResult, ProviderError> {
        let p = &self.providers;
        let status = match handle.kind {
            OperationKind::Address => {
                p.call(p.address.get_operation(&scope.project, &handle.id))
                    .await
            }
            OperationKind::ServiceConnection => {
                p.call(p.networking.get_operation(&handle.id)).await
            }
            OperationKind::FilestoreInstance => {
                p.call(p.filestore.get_operation(&handle.id)).await
            }
        };

        let result = match status {
            Err(ProviderError::NotFound(_)) => PollResult::NotFound,
            Err(err) => return Err(err),
            Ok(OperationStatus { done: false, .. }) => PollResult::Running,
            Ok(OperationStatus {
                error: Some(message),
                ..
            }) => PollResult::Failed(message),
            Ok(_) => PollResult::Done,
        };
        debug!("Polled {} operation {}: {:?}", handle.kind, handle.id, result);
        Ok(result)
    }
}
