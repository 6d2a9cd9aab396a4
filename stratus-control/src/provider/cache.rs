//! Project number lookups, cached for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::{ProjectApi, ProviderResult, with_timeout};

/// Caches project id to project number resolutions.
///
/// Built once at startup and shared through the control context.
pub struct ProjectNumberCache {
    api: Arc<dyn ProjectApi>,
    api_timeout: Duration,
    numbers: Mutex<HashMap<String, u64>>,
}

impl ProjectNumberCache {
    pub fn new(api: Arc<dyn ProjectApi>, api_timeout: Duration) -> Self {
        Self {
            api,
            api_timeout,
            numbers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the project number, asking the provider on first use.
    pub async fn get(&self, project: &str) -> ProviderResult<u64> {
        let mut numbers = self.numbers.lock().await;
        if let Some(number) = numbers.get(project) {
            return Ok(*number);
        }

        let number = with_timeout(self.api_timeout, self.api.project_number(project)).await?;
        debug!("Resolved project {} to number {}", project, number);
        numbers.insert(project.to_string(), number);
        Ok(number)
    }

    pub async fn invalidate(&self, project: &str) {
        self.numbers.lock().await.remove(project);
    }
}
