use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Declares autoscaling for one variant of a model: a model pinned to an
/// accelerator type and count.
///
/// Stored under `/variants/{namespace}/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantAutoscaling {
    /// Resource name, typically the name of the deployment serving the variant.
    pub name: String,
    pub namespace: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub spec: VariantAutoscalingSpec,

    #[serde(default)]
    pub status: VariantAutoscalingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantAutoscalingSpec {
    /// Model identifier (e.g. "meta/llama-3.1-8b").
    pub model_id: String,

    /// Business identifier, `{model_id}-{accelerator}-{accelerator_count}`.
    pub variant_id: String,

    /// Accelerator type (e.g. "A100").
    pub accelerator: String,

    /// Accelerator units per replica.
    #[serde(default = "default_accelerator_count")]
    pub accelerator_count: u32,

    /// Which configmap key holds the SLO class for this variant.
    pub slo_class_ref: ConfigMapKeyRef,

    pub variant_profile: VariantProfile,

    /// Per-variant scale-to-zero override. None means use the controller default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_to_zero: Option<ScaleToZeroSpec>,

    /// Whether the optimizer must keep the current accelerator and only resize.
    #[serde(default = "default_keep_accelerator")]
    pub keep_accelerator: bool,
}

fn default_accelerator_count() -> u32 {
    1
}

fn default_keep_accelerator() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMapKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantProfile {
    pub perf_parms: PerfParms,

    /// Maximum batch size supported by the serving engine.
    pub max_batch_size: u32,
}

/// Performance coefficients as decimal strings.
///
/// Decode: `itl = alpha + beta * batch`.
/// Prefill: `ttft = gamma + delta * input_tokens * batch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerfParms {
    #[serde(default)]
    pub decode_parms: BTreeMap<String, String>,

    #[serde(default)]
    pub prefill_parms: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleToZeroSpec {
    pub enabled: bool,

    /// How long the variant must see no requests before its floor drops to zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariantAutoscalingStatus {
    /// Aggregate load across all deployments serving this model.
    #[serde(default)]
    pub load: LoadProfile,

    #[serde(default)]
    pub itl_average: String,

    #[serde(default)]
    pub ttft_average: String,

    /// Mirrors `current_allocs[0].num_replicas` when present.
    #[serde(default)]
    pub primary_replicas: u32,

    #[serde(default)]
    pub current_allocs: Vec<Allocation>,

    #[serde(default)]
    pub desired_optimized_allocs: Vec<OptimizedAlloc>,

    #[serde(default)]
    pub actuation: ActuationStatus,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Request-level workload characteristics, as decimal strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadProfile {
    /// Requests per minute.
    pub arrival_rate: String,
    pub avg_input_tokens: String,
    pub avg_output_tokens: String,
}

/// One live deployment of the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Allocation {
    pub variant_id: String,
    pub accelerator: String,
    pub num_replicas: u32,
    pub max_batch: u32,
    pub variant_cost: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptimizedAlloc {
    pub last_run_time: DateTime<Utc>,
    pub variant_id: String,
    pub accelerator: String,
    pub num_replicas: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActuationStatus {
    pub applied: bool,
}

impl VariantAutoscaling {
    /// Unique server identity across namespaces.
    pub fn full_name(&self) -> String {
        full_name(&self.name, &self.namespace)
    }
}

pub fn full_name(name: &str, namespace: &str) -> String {
    format!("{name}:{namespace}")
}

/// Normalise a variant id into a DNS-1123 style resource name:
/// lowercase, `/` and `.` become `-`, everything else outside `[a-z0-9-]`
/// is dropped, and leading/trailing hyphens are trimmed.
pub fn suggest_resource_name(variant_id: &str) -> String {
    let name: String = variant_id
        .to_lowercase()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    name.trim_matches('-').to_string()
}

/// Log a notice when the resource name differs from the normalised variant id.
/// Both are valid; they identify different things.
pub fn check_resource_name(va: &VariantAutoscaling) -> bool {
    let suggested = suggest_resource_name(&va.spec.variant_id);
    if va.name != suggested {
        tracing::info!(
            resource_name=%va.name,
            variant_id=%va.spec.variant_id,
            suggested_name=%suggested,
            "variant resource name differs from normalized variant_id"
        );
        return false;
    }
    true
}

/// Checks `^.+-[A-Za-z0-9]+-[1-9][0-9]*$`.
pub fn is_valid_variant_id(variant_id: &str) -> bool {
    let Some((rest, count)) = variant_id.rsplit_once('-') else {
        return false;
    };
    let count_ok = count.starts_with(|c: char| ('1'..='9').contains(&c))
        && count.chars().all(|c| c.is_ascii_digit());
    let Some((model, accelerator)) = rest.rsplit_once('-') else {
        return false;
    };
    count_ok
        && !model.is_empty()
        && !accelerator.is_empty()
        && accelerator.chars().all(|c| c.is_ascii_alphanumeric())
}
