//! The optimization problem for one cycle.
//!
//! A [`SystemModel`] is rebuilt from scratch every cycle and owned by the
//! invocation that built it. All collections are ordered maps so that the
//! same inputs always iterate, solve and serialize the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::numeric::sanitize_field;
use crate::perf::PerfProfile;

/// Observed request load. Always finite and non-negative.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadObservation {
    /// Requests per minute.
    pub arrival_rate: f64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
}

impl LoadObservation {
    /// Build a sanitized observation: NaN, infinite and negative inputs read as zero.
    pub fn new(arrival_rate: f64, avg_input_tokens: f64, avg_output_tokens: f64) -> Self {
        let clean = |field: &str, v: f64| sanitize_field(field, v).max(0.0);
        Self {
            arrival_rate: clean("arrival_rate", arrival_rate),
            avg_input_tokens: clean("avg_input_tokens", avg_input_tokens),
            avg_output_tokens: clean("avg_output_tokens", avg_output_tokens),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.arrival_rate <= 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceleratorSpec {
    pub name: String,
    /// Device class, e.g. "nvidia.com/gpu".
    pub device: String,
    /// Cost per unit.
    pub cost: f64,
    /// Units per instance.
    pub multiplicity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelTarget {
    pub model: String,
    /// ms; a non-positive target leaves ITL unconstrained.
    pub slo_itl: f64,
    /// ms; a non-positive target leaves TTFT unconstrained.
    pub slo_ttft: f64,
}

impl ModelTarget {
    pub fn is_met_by(&self, itl: f64, ttft: f64) -> bool {
        (self.slo_itl <= 0.0 || itl <= self.slo_itl) && (self.slo_ttft <= 0.0 || ttft <= self.slo_ttft)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceClass {
    pub name: String,
    pub priority: i32,
    pub targets: Vec<ModelTarget>,
}

impl ServiceClass {
    pub fn target(&self, model: &str) -> Option<&ModelTarget> {
        self.targets.iter().find(|t| t.model == model)
    }
}

/// What a server is running right now.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CurrentAllocation {
    pub accelerator: String,
    pub num_replicas: u32,
    pub max_batch: u32,
    pub cost: f64,
    pub itl_average: f64,
    pub ttft_average: f64,
    pub load: LoadObservation,
}

/// One live variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEntry {
    /// Unique identity, `name:namespace`.
    pub name: String,
    pub variant_id: String,
    pub model: String,
    /// Resolved service class name.
    pub class: String,
    pub current: CurrentAllocation,
    /// 0 when scale-to-zero applies, else 1.
    pub min_num_replicas: u32,
    /// When set, only the current accelerator is a candidate.
    pub keep_accelerator: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerMode {
    /// Accelerator inventory is treated as unbounded.
    #[default]
    Unlimited,
    /// Inventory caps `sum(replicas * units)` per accelerator type. Not implemented.
    Limited,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemModel {
    pub mode: OptimizerMode,

    pub accelerators: BTreeMap<String, AcceleratorSpec>,

    /// model -> owning server (`name:namespace`) -> profile
    pub profiles: BTreeMap<String, BTreeMap<String, PerfProfile>>,

    pub service_classes: BTreeMap<String, ServiceClass>,

    pub servers: BTreeMap<String, ServerEntry>,

    /// Units available per accelerator type. Only meaningful in limited mode.
    #[serde(default)]
    pub capacity: BTreeMap<String, u64>,
}

impl SystemModel {
    pub fn new(mode: OptimizerMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn add_accelerator(&mut self, spec: AcceleratorSpec) {
        self.accelerators.insert(spec.name.clone(), spec);
    }

    /// Register the profile owned by `server`. Servers of the same model
    /// keep separate profiles even when they share an accelerator.
    pub fn add_profile(&mut self, server: impl Into<String>, profile: PerfProfile) {
        self.profiles
            .entry(profile.model.clone())
            .or_default()
            .insert(server.into(), profile);
    }

    pub fn add_service_class(&mut self, class: ServiceClass) {
        self.service_classes.insert(class.name.clone(), class);
    }

    pub fn add_server(&mut self, server: ServerEntry) {
        self.servers.insert(server.name.clone(), server);
    }

    pub fn set_capacity(&mut self, accelerator: impl Into<String>, units: u64) {
        self.capacity.insert(accelerator.into(), units);
    }

    pub fn accelerator(&self, name: &str) -> Option<&AcceleratorSpec> {
        self.accelerators.get(name)
    }

    pub fn profile(&self, model: &str, server: &str) -> Option<&PerfProfile> {
        self.profiles.get(model)?.get(server)
    }

    pub fn own_profile(&self, server: &ServerEntry) -> Option<&PerfProfile> {
        self.profile(&server.model, &server.name)
    }

    /// Profiles `server` may be placed on: its own first, then, unless it
    /// keeps its accelerator, those other servers of the model hold for
    /// other accelerators, in owner order. Empty without an own profile.
    pub fn candidate_profiles(&self, server: &ServerEntry) -> Vec<&PerfProfile> {
        let Some(own) = self.own_profile(server) else {
            return Vec::new();
        };
        let mut out = vec![own];
        if server.keep_accelerator {
            return out;
        }
        if let Some(by_owner) = self.profiles.get(&server.model) {
            out.extend(
                by_owner
                    .iter()
                    .filter(|(owner, p)| **owner != server.name && p.accelerator != own.accelerator)
                    .map(|(_, p)| p),
            );
        }
        out
    }

    pub fn target_for(&self, server: &ServerEntry) -> Option<&ModelTarget> {
        self.service_classes.get(&server.class)?.target(&server.model)
    }
}
