use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named bag of string values, the unit operators use to hand
/// configuration to the controller.
///
/// Stored under `/configmaps/{namespace}/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMap {
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// One entry of the accelerator cost configmap; the configmap key is the
/// accelerator name and the value is this record as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceleratorCostEntry {
    /// Device class (e.g. "nvidia.com/gpu").
    #[serde(default)]
    pub device: String,

    /// Unit cost as a decimal string.
    pub cost: String,

    /// Units per instance. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplicity: Option<u32>,
}

impl AcceleratorCostEntry {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// An SLO class as written in the service-class configmap (YAML).
///
/// ```yaml
/// name: Premium
/// priority: 1
/// data:
///   - model: meta/llama0-70b
///     slo-tpot: 24
///     slo-ttft: 500
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceClassConfig {
    pub name: String,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub data: Vec<ServiceClassEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceClassEntry {
    pub model: String,

    /// Target time per output token (ITL), ms.
    #[serde(rename = "slo-tpot")]
    pub slo_tpot: f64,

    /// Target time to first token, ms.
    #[serde(rename = "slo-ttft")]
    pub slo_ttft: f64,
}

impl ServiceClassConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn entry_for(&self, model: &str) -> Option<&ServiceClassEntry> {
        self.data.iter().find(|e| e.model == model)
    }
}
