//! The optimization cycle and the loop that drives it.
//!
//! A cycle lists every variant, observes its load, builds one system model
//! from all of them, solves it, and writes decisions and conditions back to
//! each variant's status. Variants that cannot be observed or configured are
//! reported through their conditions and left out of the solve.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use varscale_common::telemetry::LogLevel;
use varscale_common::variant::{check_resource_name, is_valid_variant_id};
use varscale_common::{
    set_condition, ConditionReason, ConditionStatus, ConfigMap, VariantAutoscaling,
    VariantAutoscalingSpec,
};
use varscale_core::numeric::format_decimal;
use varscale_core::solver::replica_cost;
use varscale_core::{
    Freshness, LoadObservation, MetricsCache, OptimizeError, Optimizer, OptimizerMode, SystemModel,
};
use varscale_meta::{ResourceStore, StoreError, WatchEvent, WatchStream};

use crate::actuator::{Actuator, ReplicaGauges};
use crate::adapter::{
    add_server, build_system_data, create_optimized_alloc, find_model_slo, load_profile,
    min_replicas, variant_profile,
};
use crate::collector::{collect_variant_metrics, current_allocation, MetricsSource};
use crate::config::{ControllerConfig, ControllerDefaults};
use crate::inventory::{totals, VendorRegistry};
use crate::metrics::SharedMetrics;
use crate::retry::{retry, Backoff};

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub variants: usize,
    /// Variants handed to the optimizer.
    pub optimized: usize,
    pub skipped: usize,
    /// Variants whose decision was published.
    pub actuated: usize,
    pub status_errors: usize,
    /// Set when the optimizer produced no allocation at all.
    pub optimization_error: Option<String>,
}

enum Prepared {
    /// Registered as a server.
    Ready,
    /// Left out of the solve; its conditions say why.
    Skipped,
    /// Left out of the solve without a status update.
    Ignored,
}

pub struct Reconciler {
    store: ResourceStore,
    source: Option<Arc<dyn MetricsSource>>,
    cache: MetricsCache,
    optimizer: Optimizer,
    config: ControllerConfig,
    vendors: VendorRegistry,
    actuator: Actuator,
    metrics: Arc<SharedMetrics>,
    log_level: LogLevel,
}

impl Reconciler {
    pub fn new(
        store: ResourceStore,
        source: Option<Arc<dyn MetricsSource>>,
        config: ControllerConfig,
        metrics: Arc<SharedMetrics>,
        gauges: ReplicaGauges,
    ) -> Self {
        Self {
            actuator: Actuator::new(store.clone(), gauges),
            optimizer: Optimizer::new().with_search_ceiling(config.search_ceiling),
            cache: MetricsCache::new(),
            vendors: VendorRegistry::default(),
            log_level: LogLevel::detached(&config.defaults.log_level),
            store,
            source,
            config,
            metrics,
        }
    }

    /// Apply the defaults configmap's `log_level` to this filter each cycle.
    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn log_level(&self) -> &LogLevel {
        &self.log_level
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn cache(&self) -> &MetricsCache {
        &self.cache
    }

    pub fn gauges(&self) -> &ReplicaGauges {
        self.actuator.gauges()
    }

    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> anyhow::Result<CycleReport> {
        let cfg = &self.config;

        let defaults = match self.config_map(&cfg.defaults_config_map).await {
            Ok(Some(cm)) => cfg.defaults.with_config_map(&cm),
            Ok(None) => cfg.defaults.clone(),
            Err(e) => {
                tracing::warn!(configmap=%cfg.defaults_config_map, error=%e, "failed to read defaults configmap, using startup defaults");
                cfg.defaults.clone()
            }
        };
        if self.log_level.set(&defaults.log_level) {
            tracing::info!(level = self.log_level.current(), "log level changed");
        }
        let accelerators = self.required_config_map(&cfg.accelerator_config_map).await?;
        let service_classes = self.required_config_map(&cfg.service_class_config_map).await?;

        let store = &self.store;
        let variants = retry(Backoff::STANDARD, "list variants", || store.list_variants())
            .await
            .context("listing variants")?;

        let mut report = CycleReport {
            variants: variants.len(),
            ..CycleReport::default()
        };
        self.metrics.variants.store(variants.len() as u64, Ordering::Relaxed);

        let live_models: BTreeSet<&str> = variants.iter().map(|v| v.value.spec.model_id.as_str()).collect();
        let pruned = self.cache.retain_models(|model| live_models.contains(model));
        if pruned > 0 {
            tracing::debug!(pruned, "dropped cached metrics of removed models");
        }
        let live_variants: BTreeSet<(String, String)> = variants
            .iter()
            .map(|v| (v.value.name.clone(), v.value.namespace.clone()))
            .collect();
        self.gauges()
            .retain_variants(|name, ns| live_variants.contains(&(name.to_string(), ns.to_string())));

        if variants.is_empty() {
            tracing::debug!("no variants to reconcile");
            return Ok(report);
        }

        let mut sys = build_system_data(&accelerators, &service_classes, OptimizerMode::Unlimited);
        self.apply_inventory(&mut sys).await;

        let mut ready = Vec::new();
        let mut skipped = Vec::new();
        for versioned in variants {
            let mut va = versioned.value;
            if !is_valid_variant_id(&va.spec.variant_id) {
                tracing::warn!(variant=%va.full_name(), variant_id=%va.spec.variant_id, "variant_id is not {{model}}-{{accelerator}}-{{count}}, skipping");
                report.skipped += 1;
                continue;
            }
            check_resource_name(&va);

            match self.prepare(&mut va, &mut sys, &service_classes, &defaults, now).await {
                Prepared::Ready => ready.push(va),
                Prepared::Skipped => {
                    report.skipped += 1;
                    skipped.push(va);
                }
                Prepared::Ignored => report.skipped += 1,
            }
        }
        report.optimized = ready.len();

        if !ready.is_empty() {
            match self.optimizer.optimize(&sys) {
                Ok(out) => {
                    tracing::debug!(
                        servers = out.solution.len(),
                        failures = out.failures.len(),
                        total_cost = out.solution.total_cost(),
                        "optimization finished"
                    );
                    self.metrics
                        .optimization_failures_total
                        .fetch_add(out.failures.len() as u64, Ordering::Relaxed);
                    for va in &mut ready {
                        match create_optimized_alloc(va, &out.solution, now) {
                            Some(alloc) => {
                                let msg = format!("{} replicas on {}", alloc.num_replicas, alloc.accelerator);
                                va.status.desired_optimized_allocs = vec![alloc];
                                set_condition(
                                    &mut va.status.conditions,
                                    ConditionStatus::True,
                                    ConditionReason::OptimizationSucceeded,
                                    msg,
                                    now,
                                );
                                if self.actuator.emit_metrics(va).await {
                                    report.actuated += 1;
                                }
                            }
                            None => {
                                let msg = out
                                    .failures
                                    .get(&va.full_name())
                                    .map(|e| e.to_string())
                                    .unwrap_or_else(|| "no allocation produced".to_string());
                                set_condition(
                                    &mut va.status.conditions,
                                    ConditionStatus::False,
                                    ConditionReason::OptimizationFailed,
                                    msg,
                                    now,
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error=%e, servers = ready.len(), "optimization failed");
                    self.metrics
                        .optimization_failures_total
                        .fetch_add(ready.len() as u64, Ordering::Relaxed);
                    for va in &mut ready {
                        let msg = match &e {
                            OptimizeError::NoFeasibleAllocation { failures } => failures
                                .get(&va.full_name())
                                .map(|f| f.to_string())
                                .unwrap_or_else(|| e.to_string()),
                            OptimizeError::CapacityModeUnsupported => e.to_string(),
                        };
                        set_condition(
                            &mut va.status.conditions,
                            ConditionStatus::False,
                            ConditionReason::OptimizationFailed,
                            msg,
                            now,
                        );
                    }
                    report.optimization_error = Some(e.to_string());
                }
            }
        }

        for va in ready.iter().chain(skipped.iter()) {
            if self.write_status(va).await.is_err() {
                report.status_errors += 1;
            }
        }

        tracing::info!(
            variants = report.variants,
            optimized = report.optimized,
            skipped = report.skipped,
            actuated = report.actuated,
            "reconcile cycle complete"
        );
        Ok(report)
    }

    /// Register `va` with the system model, updating its status with what
    /// was observed along the way.
    async fn prepare(
        &self,
        va: &mut VariantAutoscaling,
        sys: &mut SystemModel,
        service_classes: &ConfigMap,
        defaults: &ControllerDefaults,
        now: DateTime<Utc>,
    ) -> Prepared {
        let variant = va.full_name();
        let model = va.spec.model_id.clone();

        let class = match find_model_slo(service_classes, &va.spec.slo_class_ref.key, &model) {
            Ok((_, class)) => class,
            Err(e) => {
                tracing::warn!(variant=%variant, model_id=%model, error=%e, "failed to resolve SLO, skipping variant");
                optimization_failed(va, e.to_string(), now);
                return Prepared::Skipped;
            }
        };
        let profile = match variant_profile(va) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(variant=%variant, error=%e, "invalid performance profile, skipping variant");
                optimization_failed(va, e.to_string(), now);
                return Prepared::Skipped;
            }
        };

        let store = &self.store;
        let (ns, name) = (va.namespace.clone(), va.name.clone());
        let deployment = match retry(Backoff::STANDARD, "get deployment", || store.get_deployment(&ns, &name)).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                tracing::warn!(variant=%variant, "deployment not found, skipping variant");
                return Prepared::Ignored;
            }
            Err(e) => {
                tracing::warn!(variant=%variant, error=%e, "failed to read deployment, skipping variant");
                return Prepared::Ignored;
            }
        };
        let unit_cost = sys
            .accelerator(&profile.accelerator)
            .map(|acc| replica_cost(acc, &profile))
            .unwrap_or(0.0);
        let alloc = current_allocation(va, &deployment, unit_cost);
        va.status.primary_replicas = alloc.num_replicas;
        va.status.current_allocs = vec![alloc];

        let Some(observation) = self.observe(va, now).await else {
            set_condition(
                &mut va.status.conditions,
                ConditionStatus::False,
                ConditionReason::MetricsUnavailable,
                "load metrics are unavailable",
                now,
            );
            return Prepared::Skipped;
        };
        va.status.load = load_profile(&observation);

        let floor = min_replicas(va, defaults, &self.cache.lookup(&model, now));
        if let Err(e) = add_server(sys, va, profile, &class, floor) {
            tracing::warn!(variant=%variant, error=%e, "failed to add server, skipping variant");
            optimization_failed(va, e.to_string(), now);
            return Prepared::Skipped;
        }
        Prepared::Ready
    }

    /// Current load of `va`'s model, from Prometheus or else the cache.
    /// Sets `MetricsAvailable` accordingly.
    async fn observe(&self, va: &mut VariantAutoscaling, now: DateTime<Utc>) -> Option<LoadObservation> {
        let model = va.spec.model_id.clone();
        let Some(source) = &self.source else {
            set_condition(
                &mut va.status.conditions,
                ConditionStatus::False,
                ConditionReason::MetricsMissing,
                "no metrics source configured",
                now,
            );
            return None;
        };

        let retention = self.config.metrics_retention;
        let err = match collect_variant_metrics(source.as_ref(), va, retention).await {
            Ok(m) => {
                self.cache.put(&model, m.load, retention, m.total_requests, now);
                va.status.itl_average = format_decimal(m.itl_average);
                va.status.ttft_average = format_decimal(m.ttft_average);
                set_condition(
                    &mut va.status.conditions,
                    ConditionStatus::True,
                    ConditionReason::MetricsFound,
                    format!("arrival rate {} req/min", format_decimal(m.load.arrival_rate)),
                    now,
                );
                return Some(m.load);
            }
            Err(e) => e,
        };

        self.metrics.metrics_query_errors_total.fetch_add(1, Ordering::Relaxed);
        match self.cache.lookup(&model, now) {
            Freshness::Fresh(cached) => {
                tracing::warn!(variant=%va.full_name(), error=%err, "metrics query failed, using cached load");
                set_condition(
                    &mut va.status.conditions,
                    ConditionStatus::True,
                    ConditionReason::MetricsFound,
                    format!("using cached metrics: {err}"),
                    now,
                );
                Some(cached.observation)
            }
            Freshness::Stale(cached) => {
                tracing::warn!(variant=%va.full_name(), error=%err, updated_at=%cached.updated_at, "metrics query failed, cached load is stale");
                set_condition(
                    &mut va.status.conditions,
                    ConditionStatus::False,
                    ConditionReason::MetricsStale,
                    format!("cached metrics from {} are stale: {err}", cached.updated_at.to_rfc3339()),
                    now,
                );
                Some(cached.observation)
            }
            Freshness::Missing => {
                tracing::warn!(variant=%va.full_name(), error=%err, "metrics query failed, no cached load");
                set_condition(
                    &mut va.status.conditions,
                    ConditionStatus::False,
                    ConditionReason::PrometheusError,
                    format!("metrics query failed: {err}"),
                    now,
                );
                None
            }
        }
    }

    async fn config_map(&self, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        let store = &self.store;
        let ns = self.config.config_namespace.as_str();
        retry(Backoff::STANDARD, "get configmap", || store.get_config_map(ns, name)).await
    }

    async fn required_config_map(&self, name: &str) -> anyhow::Result<ConfigMap> {
        let ns = &self.config.config_namespace;
        self.config_map(name)
            .await
            .with_context(|| format!("reading configmap {ns}/{name}"))?
            .ok_or_else(|| anyhow!("configmap {ns}/{name} not found"))
    }

    /// Record per-accelerator unit totals. Only consulted in limited mode.
    async fn apply_inventory(&self, sys: &mut SystemModel) {
        match self.store.list_nodes().await {
            Ok(nodes) => {
                for (accelerator, units) in totals(&self.vendors.collect(&nodes)) {
                    sys.set_capacity(accelerator, units);
                }
            }
            Err(e) => tracing::warn!(error=%e, "failed to list nodes, capacity unknown"),
        }
    }

    async fn write_status(&self, va: &VariantAutoscaling) -> Result<(), StoreError> {
        let store = &self.store;
        let res = retry(Backoff::STANDARD, "update variant status", || {
            store.update_variant_status(&va.namespace, &va.name, &va.status)
        })
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(variant=%va.full_name(), "variant deleted during cycle, status dropped");
                Ok(())
            }
            Err(e) => {
                self.metrics.status_update_errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(variant=%va.full_name(), error=%e, "failed to update variant status");
                Err(e)
            }
        }
    }
}

fn optimization_failed(va: &mut VariantAutoscaling, message: String, now: DateTime<Utc>) {
    set_condition(
        &mut va.status.conditions,
        ConditionStatus::False,
        ConditionReason::OptimizationFailed,
        message,
        now,
    );
}

/// Wakes on variant spec changes and deletions. Status-only writes,
/// including the controller's own, are ignored.
pub struct SpecWatch {
    store: ResourceStore,
    stream: Option<WatchStream>,
    seen: HashMap<String, VariantAutoscalingSpec>,
}

impl SpecWatch {
    pub fn new(store: ResourceStore) -> Self {
        Self {
            store,
            stream: None,
            seen: HashMap::new(),
        }
    }

    /// Resolve with the key of the next changed variant. Cancel-safe.
    pub async fn changed(&mut self) -> String {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.open().await;
                continue;
            };
            match stream.next().await {
                Some(ev) => {
                    let key = ev.key.clone();
                    if self.observe(ev) {
                        return key;
                    }
                }
                None => {
                    tracing::warn!("variant watch ended, reopening");
                    self.stream = None;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn open(&mut self) {
        let stream = match self.store.watch_variants().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error=%e, "failed to watch variants, retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
                return;
            }
        };
        match self.store.list_variants().await {
            Ok(variants) => {
                self.seen = variants
                    .into_iter()
                    .map(|v| {
                        let key = varscale_meta::resources::variant_key(&v.value.namespace, &v.value.name);
                        (key, v.value.spec)
                    })
                    .collect();
            }
            Err(e) => tracing::warn!(error=%e, "failed to list variants for watch baseline"),
        }
        self.stream = Some(stream);
    }

    /// Whether `ev` changes a spec.
    fn observe(&mut self, ev: WatchEvent) -> bool {
        let Some(raw) = ev.value else {
            return self.seen.remove(&ev.key).is_some();
        };
        match serde_json::from_slice::<VariantAutoscaling>(&raw) {
            Ok(va) => {
                if self.seen.get(&ev.key) == Some(&va.spec) {
                    return false;
                }
                self.seen.insert(ev.key, va.spec);
                true
            }
            Err(e) => {
                tracing::debug!(key=%ev.key, error=%e, "ignoring undecodable variant event");
                false
            }
        }
    }
}

/// Run cycles forever: every `reconcile_interval`, sooner when a variant
/// spec changes, and on the reconcile backoff after a failed cycle.
pub async fn reconcile_loop(reconciler: Arc<Reconciler>) {
    let interval = reconciler.config.reconcile_interval;
    let mut watch = SpecWatch::new(reconciler.store.clone());
    let mut failures: u32 = 0;
    tracing::info!(
        interval_secs = interval.as_secs(),
        search_ceiling = reconciler.optimizer.search_ceiling(),
        "reconcile loop started"
    );

    loop {
        reconciler.metrics.reconcile_total.fetch_add(1, Ordering::Relaxed);
        match reconciler.reconcile_once(Utc::now()).await {
            Ok(report) => {
                failures = 0;
                if let Some(e) = &report.optimization_error {
                    reconciler.metrics.reconcile_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error=%e, "cycle produced no allocation");
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                reconciler.metrics.reconcile_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error=%e, failures, "reconcile cycle failed");
            }
        }

        let wait = if failures > 0 {
            Backoff::RECONCILE.base_delay(failures - 1).min(interval)
        } else {
            interval
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            key = watch.changed() => tracing::info!(key=%key, "variant spec changed, reconciling early"),
        }
    }
}
