//! Publishes optimizer decisions for external autoscalers to act on.

use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::DashMap;
use varscale_common::VariantAutoscaling;
use varscale_meta::ResourceStore;

use crate::retry::{retry, Backoff};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GaugeKey {
    pub variant_name: String,
    pub namespace: String,
    pub variant_id: String,
    pub accelerator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaValues {
    pub current: u32,
    pub desired: u32,
}

impl ReplicaValues {
    /// desired / current, with an idle deployment counted as one replica.
    pub fn ratio(&self) -> f64 {
        f64::from(self.desired) / f64::from(self.current.max(1))
    }
}

/// Per-variant replica gauges. One series per variant: setting a value on
/// a new accelerator replaces the old series.
#[derive(Debug, Clone, Default)]
pub struct ReplicaGauges {
    series: Arc<DashMap<GaugeKey, ReplicaValues>>,
}

impl ReplicaGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: GaugeKey, values: ReplicaValues) {
        self.series
            .retain(|k, _| !(k.variant_name == key.variant_name && k.namespace == key.namespace) || *k == key);
        self.series.insert(key, values);
    }

    pub fn get(&self, variant_name: &str, namespace: &str) -> Option<(GaugeKey, ReplicaValues)> {
        self.series
            .iter()
            .find(|e| e.key().variant_name == variant_name && e.key().namespace == namespace)
            .map(|e| (e.key().clone(), *e.value()))
    }

    /// Drop series of variants that no longer exist.
    pub fn retain_variants<F>(&self, mut live: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.series.retain(|k, _| live(&k.variant_name, &k.namespace));
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Prometheus text exposition, series sorted by label set.
    pub fn render(&self, body: &mut String) {
        let mut rows: Vec<(GaugeKey, ReplicaValues)> =
            self.series.iter().map(|e| (e.key().clone(), *e.value())).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let families: [(&str, &str, fn(&ReplicaValues) -> String); 3] = [
            ("varscale_current_replicas", "Replicas currently running per variant.", |v| v.current.to_string()),
            ("varscale_desired_replicas", "Replicas chosen by the optimizer per variant.", |v| v.desired.to_string()),
            ("varscale_desired_ratio", "Desired over current replicas per variant.", |v| v.ratio().to_string()),
        ];
        for (name, help, value) in families {
            let _ = writeln!(body, "# HELP {name} {help}");
            let _ = writeln!(body, "# TYPE {name} gauge");
            for (k, v) in &rows {
                let _ = writeln!(
                    body,
                    "{name}{{variant_name=\"{}\",namespace=\"{}\",variant_id=\"{}\",accelerator=\"{}\"}} {}",
                    escape(&k.variant_name),
                    escape(&k.namespace),
                    escape(&k.variant_id),
                    escape(&k.accelerator),
                    value(v)
                );
            }
        }
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

pub struct Actuator {
    store: ResourceStore,
    gauges: ReplicaGauges,
}

impl Actuator {
    pub fn new(store: ResourceStore, gauges: ReplicaGauges) -> Self {
        Self { store, gauges }
    }

    pub fn gauges(&self) -> &ReplicaGauges {
        &self.gauges
    }

    /// Replicas running for `va`: the deployment record when readable,
    /// else the allocation last written to the status.
    pub async fn current_replicas(&self, va: &VariantAutoscaling) -> u32 {
        let store = &self.store;
        let (ns, name) = (va.namespace.as_str(), va.name.as_str());
        match retry(Backoff::STANDARD, "get deployment", || store.get_deployment(ns, name)).await {
            Ok(Some(dep)) => return dep.current_replicas(),
            Ok(None) => tracing::debug!(variant=%va.full_name(), "deployment not found, using status allocation"),
            Err(e) => tracing::warn!(variant=%va.full_name(), error=%e, "failed to read deployment, using status allocation"),
        }
        va.status
            .current_allocs
            .iter()
            .find(|a| a.accelerator == va.spec.accelerator)
            .or_else(|| va.status.current_allocs.first())
            .map(|a| a.num_replicas)
            .unwrap_or(0)
    }

    /// Publish the latest optimized allocation of `va` and mark it applied.
    /// Returns false when there is nothing to publish.
    pub async fn emit_metrics(&self, va: &mut VariantAutoscaling) -> bool {
        let Some(desired) = va.status.desired_optimized_allocs.first().cloned() else {
            tracing::debug!(variant=%va.full_name(), "no optimized allocation, skipping actuation");
            return false;
        };
        let current = self.current_replicas(va).await;
        let values = ReplicaValues {
            current,
            desired: desired.num_replicas,
        };
        self.gauges.set(
            GaugeKey {
                variant_name: va.name.clone(),
                namespace: va.namespace.clone(),
                variant_id: va.spec.variant_id.clone(),
                accelerator: desired.accelerator.clone(),
            },
            values,
        );
        va.status.actuation.applied = true;
        tracing::info!(
            variant=%va.full_name(),
            accelerator=%desired.accelerator,
            current,
            desired=desired.num_replicas,
            "published replica targets"
        );
        true
    }
}
