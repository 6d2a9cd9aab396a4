use serde::{Deserialize, Serialize};

/// Provider placement of one remote cluster: project, VPC network and default region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub project: String,
    pub vpc_network: String,
    pub region: String,
}

impl Scope {
    pub fn new(
        project: impl Into<String>,
        vpc_network: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            vpc_network: vpc_network.into(),
            region: region.into(),
        }
    }

    /// Fully qualified network path, `projects/<project>/global/networks/<vpc>`.
    pub fn network_path(&self) -> String {
        format!(
            "projects/{}/global/networks/{}",
            self.project, self.vpc_network
        )
    }

    /// True if `network` names this scope's VPC, as a bare name or a path ending in `/<vpc>`.
    pub fn owns_network(&self, network: &str) -> bool {
        network == self.vpc_network || network.ends_with(&format!("/{}", self.vpc_network))
    }
}
