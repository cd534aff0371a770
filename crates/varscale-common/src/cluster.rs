use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scale target serving a variant.
///
/// Stored under `/deployments/{namespace}/{name}`; the name matches the
/// variant resource name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,

    /// Desired replicas as declared on the deployment.
    pub replicas: u32,

    /// Replicas actually running. None until the runtime reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_replicas: Option<u32>,
}

impl DeploymentInfo {
    /// Prefer the observed count over the declared one.
    pub fn current_replicas(&self) -> u32 {
        self.status_replicas.unwrap_or(self.replicas)
    }
}

/// A cluster node as seen by inventory discovery.
///
/// Stored under `/nodes/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Allocatable resources, e.g. `"nvidia.com/gpu" -> 4`.
    #[serde(default)]
    pub allocatable: BTreeMap<String, u64>,
}
