//! Typed access to the resources the controller reads and writes.
//!
//! Layout:
//!
//! ```text
//! /variants/{namespace}/{name}    VariantAutoscaling
//! /configmaps/{namespace}/{name}  ConfigMap
//! /deployments/{namespace}/{name} DeploymentInfo
//! /nodes/{name}                   NodeInfo
//! ```

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use varscale_common::{ConfigMap, DeploymentInfo, NodeInfo, VariantAutoscaling, VariantAutoscalingStatus};

use crate::types::{KvBackend, StoreError, StoreResult, WatchStream};

pub const VARIANTS_PREFIX: &str = "/variants/";
pub const CONFIGMAPS_PREFIX: &str = "/configmaps/";
pub const DEPLOYMENTS_PREFIX: &str = "/deployments/";
pub const NODES_PREFIX: &str = "/nodes/";

/// A decoded record and the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

#[derive(Clone)]
pub struct ResourceStore {
    backend: Arc<dyn KvBackend>,
}

pub fn variant_key(namespace: &str, name: &str) -> String {
    format!("{VARIANTS_PREFIX}{namespace}/{name}")
}

pub fn config_map_key(namespace: &str, name: &str) -> String {
    format!("{CONFIGMAPS_PREFIX}{namespace}/{name}")
}

pub fn deployment_key(namespace: &str, name: &str) -> String {
    format!("{DEPLOYMENTS_PREFIX}{namespace}/{name}")
}

pub fn node_key(name: &str) -> String {
    format!("{NODES_PREFIX}{name}")
}

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Invalid {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(raw).map_err(|e| StoreError::Invalid {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl ResourceStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<Versioned<T>>> {
        match self.backend.get(key).await? {
            Some(kv) => Ok(Some(Versioned {
                value: decode(key, &kv.value)?,
                revision: kv.revision,
            })),
            None => Ok(None),
        }
    }

    /// List and decode every record under `prefix`. Undecodable records
    /// are skipped with a warning so one bad entry cannot stall a cycle.
    async fn list<T: DeserializeOwned>(&self, prefix: &str) -> StoreResult<Vec<Versioned<T>>> {
        let mut out = Vec::new();
        for kv in self.backend.list_prefix(prefix).await? {
            match decode(&kv.key, &kv.value) {
                Ok(value) => out.push(Versioned {
                    value,
                    revision: kv.revision,
                }),
                Err(e) => tracing::warn!(key = %kv.key, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<u64> {
        self.backend.put(key, encode(key, value)?).await
    }

    // variants

    pub async fn list_variants(&self) -> StoreResult<Vec<Versioned<VariantAutoscaling>>> {
        self.list(VARIANTS_PREFIX).await
    }

    pub async fn get_variant(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<Versioned<VariantAutoscaling>>> {
        self.read(&variant_key(namespace, name)).await
    }

    pub async fn put_variant(&self, va: &VariantAutoscaling) -> StoreResult<u64> {
        self.write(&variant_key(&va.namespace, &va.name), va).await
    }

    pub async fn delete_variant(&self, namespace: &str, name: &str) -> StoreResult<u64> {
        self.backend.delete(&variant_key(namespace, name)).await
    }

    /// Replace the status of the latest stored copy of a variant, leaving its
    /// spec untouched. Fails with `Conflict` if the record moves in between.
    pub async fn update_variant_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VariantAutoscalingStatus,
    ) -> StoreResult<u64> {
        let key = variant_key(namespace, name);
        let Some(current) = self.read::<VariantAutoscaling>(&key).await? else {
            return Err(StoreError::NotFound(key));
        };
        let mut updated = current.value;
        updated.status = status.clone();

        match self
            .backend
            .compare_and_swap(&key, current.revision, encode(&key, &updated)?)
            .await?
        {
            Ok(rev) => Ok(rev),
            Err(actual) => Err(StoreError::Conflict {
                key,
                expected: current.revision,
                actual,
            }),
        }
    }

    pub async fn watch_variants(&self) -> StoreResult<WatchStream> {
        self.backend.watch_prefix(VARIANTS_PREFIX).await
    }

    // config maps

    pub async fn get_config_map(&self, namespace: &str, name: &str) -> StoreResult<Option<ConfigMap>> {
        Ok(self
            .read(&config_map_key(namespace, name))
            .await?
            .map(|v: Versioned<ConfigMap>| v.value))
    }

    pub async fn put_config_map(&self, cm: &ConfigMap) -> StoreResult<u64> {
        self.write(&config_map_key(&cm.namespace, &cm.name), cm).await
    }

    // deployments

    pub async fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Option<DeploymentInfo>> {
        Ok(self
            .read(&deployment_key(namespace, name))
            .await?
            .map(|v: Versioned<DeploymentInfo>| v.value))
    }

    pub async fn put_deployment(&self, deployment: &DeploymentInfo) -> StoreResult<u64> {
        self.write(&deployment_key(&deployment.namespace, &deployment.name), deployment)
            .await
    }

    // nodes

    pub async fn list_nodes(&self) -> StoreResult<Vec<NodeInfo>> {
        Ok(self
            .list::<NodeInfo>(NODES_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn put_node(&self, node: &NodeInfo) -> StoreResult<u64> {
        self.write(&node_key(&node.name), node).await
    }
}
