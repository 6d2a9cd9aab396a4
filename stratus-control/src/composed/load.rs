//! Loading a provider object by canonical name with a legacy-name fallback.

use futures::future::BoxFuture;
use tracing::info;

use crate::error::ProviderError;

/// Which lookup produced the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<T> {
    Canonical(T),
    Legacy(T),
    Absent,
}

impl<T> Loaded<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Loaded::Canonical(value) | Loaded::Legacy(value) => Some(value),
            Loaded::Absent => None,
        }
    }
}

/// Look up `canonical`; on not-found try `legacy`.
///
/// A legacy hit is kept only if `in_scope` accepts it, otherwise the object
/// counts as absent. The canonical hit is returned as is; the caller decides
/// what a canonical object outside its scope means.
pub async fn load_with_fallback<T, F>(
    canonical: &str,
    legacy: Option<&str>,
    fetch: F,
    in_scope: impl Fn(&T) -> bool,
) -> Result<Loaded<T>, ProviderError>
where
    F: Fn(String) -> BoxFuture<'static, Result<T, ProviderError>>,
{
    match fetch(canonical.to_string()).await {
        Ok(value) => return Ok(Loaded::Canonical(value)),
        Err(ProviderError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    let Some(legacy) = legacy.filter(|name| *name != canonical) else {
        return Ok(Loaded::Absent);
    };

    match fetch(legacy.to_string()).await {
        Ok(value) if in_scope(&value) => Ok(Loaded::Legacy(value)),
        Ok(_) => {
            info!("Ignoring legacy object {} outside the current scope", legacy);
            Ok(Loaded::Absent)
        }
        Err(ProviderError::NotFound(_)) => Ok(Loaded::Absent),
        Err(err) => Err(err),
    }
}
