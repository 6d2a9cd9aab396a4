use std::sync::Arc;

use crate::config::ControlConfig;
use crate::poller::OperationPoller;
use crate::provider::{ProjectNumberCache, Providers, SimProvider};

/// Process-wide collaborators shared by every cluster's reconcilers.
#[derive(Clone)]
pub struct ControlContext {
    pub config: ControlConfig,
    pub providers: Providers,
    pub project_numbers: Arc<ProjectNumberCache>,
    pub poller: OperationPoller,
}

impl ControlContext {
    pub fn new(config: ControlConfig, providers: Providers) -> Self {
        let project_numbers = Arc::new(ProjectNumberCache::new(
            providers.projects.clone(),
            providers.api_timeout,
        ));
        let poller = OperationPoller::new(providers.clone());
        Self {
            config,
            providers,
            project_numbers,
            poller,
        }
    }

    /// Context backed entirely by `sim`.
    pub fn simulated(config: ControlConfig, sim: Arc<SimProvider>) -> Self {
        let providers = Providers::simulated(sim, config.api_timeout);
        Self::new(config, providers)
    }
}
