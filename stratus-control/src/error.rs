//! Error types for the control plane.

use std::time::Duration;

use stratus_api::StoreError;
use thiserror::Error;

/// Errors returned by provider API calls.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The named provider object or operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider rejected or failed the call.
    #[error("provider api error {code}: {message}")]
    Api { code: u16, message: String },

    /// The call did not finish within the configured API timeout.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn api(code: u16, message: impl Into<String>) -> Self {
        ProviderError::Api {
            code,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

/// Errors surfaced by the looper, runner, manager and pipeline driver.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error("failed to build connection to cluster {cluster}: {message}")]
    ConnectionBuild { cluster: String, message: String },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
