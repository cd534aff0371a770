//! Translation between variant resources and the optimizer's system model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use varscale_common::{
    AcceleratorCostEntry, ConfigMap, LoadProfile, OptimizedAlloc, ServiceClassConfig,
    ServiceClassEntry, VariantAutoscaling,
};
use varscale_core::numeric::{format_decimal, is_decimal_string, parse_decimal, sanitize_field};
use varscale_core::{
    AcceleratorSpec, AllocationSolution, ConfigError, CurrentAllocation, DecodeParams, Freshness,
    LoadObservation, ModelTarget, OptimizerMode, PerfProfile, PrefillParams, ServerEntry,
    ServiceClass, SystemModel,
};

use crate::config::ControllerDefaults;

/// Accelerators and service classes from their configmaps. Entries that do
/// not parse are skipped with a warning; the rest of the cycle proceeds.
pub fn build_system_data(
    accelerator_cm: &ConfigMap,
    service_class_cm: &ConfigMap,
    mode: OptimizerMode,
) -> SystemModel {
    let mut sys = SystemModel::new(mode);

    for (name, raw) in &accelerator_cm.data {
        match parse_accelerator(name, raw) {
            Some(spec) => sys.add_accelerator(spec),
            None => tracing::warn!(accelerator=%name, "failed to parse accelerator cost, skipping accelerator"),
        }
    }

    for (key, raw) in &service_class_cm.data {
        match ServiceClassConfig::from_yaml(raw) {
            Ok(sc) => sys.add_service_class(to_service_class(&sc)),
            Err(e) => tracing::warn!(key=%key, error=%e, "failed to parse service class, skipping service class"),
        }
    }

    sys
}

fn parse_accelerator(name: &str, raw: &str) -> Option<AcceleratorSpec> {
    let entry = AcceleratorCostEntry::from_json(raw).ok()?;
    let cost = entry
        .cost
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|c| c.is_finite() && *c >= 0.0)?;
    Some(AcceleratorSpec {
        name: name.to_string(),
        device: entry.device,
        cost,
        multiplicity: entry.multiplicity.unwrap_or(1).max(1),
    })
}

fn to_service_class(sc: &ServiceClassConfig) -> ServiceClass {
    ServiceClass {
        name: sc.name.clone(),
        priority: sc.priority,
        targets: sc
            .data
            .iter()
            .map(|e| ModelTarget {
                model: e.model.clone(),
                slo_itl: sanitize_field("slo-tpot", e.slo_tpot),
                slo_ttft: sanitize_field("slo-ttft", e.slo_ttft),
            })
            .collect(),
    }
}

/// Resolve the SLO entry and class name for `model`.
///
/// The class under `slo_key` is authoritative when present. Without it
/// every class in the configmap is searched in key order.
pub fn find_model_slo(
    service_class_cm: &ConfigMap,
    slo_key: &str,
    model: &str,
) -> Result<(ServiceClassEntry, String), ConfigError> {
    if let Some(raw) = service_class_cm.data.get(slo_key) {
        let sc = ServiceClassConfig::from_yaml(raw).map_err(|e| ConfigError::InvalidServiceClass {
            key: slo_key.to_string(),
            reason: e.to_string(),
        })?;
        return sc
            .entry_for(model)
            .map(|entry| (entry.clone(), sc.name.clone()))
            .ok_or_else(|| ConfigError::MissingSlo(model.to_string()));
    }

    for raw in service_class_cm.data.values() {
        let Ok(sc) = ServiceClassConfig::from_yaml(raw) else {
            continue;
        };
        if let Some(entry) = sc.entry_for(model) {
            return Ok((entry.clone(), sc.name.clone()));
        }
    }
    Err(ConfigError::MissingSlo(model.to_string()))
}

/// The variant's own performance profile, with its coefficients validated.
pub fn variant_profile(va: &VariantAutoscaling) -> Result<PerfProfile, ConfigError> {
    let parms = &va.spec.variant_profile.perf_parms;
    Ok(PerfProfile {
        model: va.spec.model_id.clone(),
        accelerator: va.spec.accelerator.clone(),
        accelerator_count: va.spec.accelerator_count.max(1),
        max_batch_size: va.spec.variant_profile.max_batch_size,
        decode: DecodeParams::from_map(&parms.decode_parms)?,
        prefill: PrefillParams::from_map(&parms.prefill_parms)?,
    })
}

/// Register the variant as a server owning `profile`, using the load and
/// allocation already written to its status.
pub fn add_server(
    sys: &mut SystemModel,
    va: &VariantAutoscaling,
    profile: PerfProfile,
    class_name: &str,
    min_num_replicas: u32,
) -> Result<(), ConfigError> {
    let status = &va.status;
    let Some(alloc) = status.current_allocs.first() else {
        return Err(ConfigError::NoCurrentAllocation(va.name.clone()));
    };

    let load = LoadObservation::new(
        status_decimal("arrival_rate", &status.load.arrival_rate),
        status_decimal("avg_input_tokens", &status.load.avg_input_tokens),
        status_decimal("avg_output_tokens", &status.load.avg_output_tokens),
    );

    let name = va.full_name();
    sys.add_profile(name.clone(), profile);
    sys.add_server(ServerEntry {
        name,
        variant_id: va.spec.variant_id.clone(),
        model: va.spec.model_id.clone(),
        class: class_name.to_string(),
        current: CurrentAllocation {
            accelerator: alloc.accelerator.clone(),
            num_replicas: alloc.num_replicas,
            max_batch: alloc.max_batch,
            cost: status_decimal("variant_cost", &alloc.variant_cost),
            itl_average: status_decimal("itl_average", &status.itl_average),
            ttft_average: status_decimal("ttft_average", &status.ttft_average),
            load,
        },
        min_num_replicas,
        keep_accelerator: va.spec.keep_accelerator,
    });
    Ok(())
}

/// Status decimals are written as `^\d+(\.\d+)?$`; anything else reads as zero.
fn status_decimal(field: &str, raw: &str) -> f64 {
    let raw = raw.trim();
    if !raw.is_empty() && !is_decimal_string(raw) {
        tracing::debug!(field, raw, "malformed status decimal replaced with 0");
        return 0.0;
    }
    parse_decimal(field, raw)
}

/// Replica floor for a variant.
///
/// Scale-to-zero comes from the variant, else the controller default. With
/// a retention period the floor only drops to zero once the cache holds a
/// fresh observation with no requests over at least that period.
pub fn min_replicas(va: &VariantAutoscaling, defaults: &ControllerDefaults, cached: &Freshness) -> u32 {
    let (enabled, retention) = match &va.spec.scale_to_zero {
        Some(s) => (s.enabled, s.retention_period_secs),
        None => (defaults.scale_to_zero_enabled, None),
    };
    if !enabled {
        return 1;
    }
    let Some(secs) = retention else {
        return 0;
    };
    match cached {
        Freshness::Fresh(m) if m.confirmed_idle() && m.retention >= Duration::from_secs(secs) => 0,
        _ => 1,
    }
}

/// The solver's decision for `va`, if it made one.
pub fn create_optimized_alloc(
    va: &VariantAutoscaling,
    solution: &AllocationSolution,
    now: DateTime<Utc>,
) -> Option<OptimizedAlloc> {
    let decision = solution.get(&va.full_name())?;
    tracing::debug!(variant=%va.full_name(), accelerator=%decision.accelerator, replicas=decision.num_replicas, "optimized allocation");
    Some(OptimizedAlloc {
        last_run_time: now,
        variant_id: va.spec.variant_id.clone(),
        accelerator: decision.accelerator.clone(),
        num_replicas: decision.num_replicas,
    })
}

pub fn load_profile(load: &LoadObservation) -> LoadProfile {
    LoadProfile {
        arrival_rate: format_decimal(load.arrival_rate),
        avg_input_tokens: format_decimal(load.avg_input_tokens),
        avg_output_tokens: format_decimal(load.avg_output_tokens),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use varscale_common::{Allocation, ScaleToZeroSpec};
    use varscale_core::{MetricsCache, Optimizer};

    use super::*;
    use crate::collector::tests::variant;

    const PREMIUM: &str = "name: Premium\npriority: 1\ndata:\n  - model: llama\n    slo-tpot: 50\n    slo-ttft: 1000\n";
    const FREEMIUM: &str = "name: Freemium\npriority: 10\ndata:\n  - model: granite\n    slo-tpot: 200\n    slo-ttft: 2000\n";

    fn accelerator_cm() -> ConfigMap {
        ConfigMap::new("accelerator-unit-costs", "varscale-system")
            .with_entry("A100", r#"{"device":"nvidia.com/gpu","cost":"40.00"}"#)
            .with_entry("MI300X", r#"{"device":"amd.com/gpu","cost":"65","multiplicity":2}"#)
            .with_entry("BROKEN", r#"{"device":"nvidia.com/gpu","cost":"cheap"}"#)
            .with_entry("NOTJSON", "cost=1")
    }

    fn service_class_cm() -> ConfigMap {
        ConfigMap::new("service-classes-config", "varscale-system")
            .with_entry("premium", PREMIUM)
            .with_entry("freemium", FREEMIUM)
            .with_entry("bad", "name: [unterminated")
    }

    fn defaults(scale_to_zero: bool) -> ControllerDefaults {
        ControllerDefaults {
            scale_to_zero_enabled: scale_to_zero,
            log_level: "info".to_string(),
        }
    }

    fn with_alloc(mut va: VariantAutoscaling, replicas: u32) -> VariantAutoscaling {
        va.status.load = load_profile(&LoadObservation::new(60.0, 0.0, 100.0));
        va.status.current_allocs = vec![Allocation {
            variant_id: va.spec.variant_id.clone(),
            accelerator: va.spec.accelerator.clone(),
            num_replicas: replicas,
            max_batch: 4,
            variant_cost: "40.00".to_string(),
        }];
        va
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_build_system_data_skips_bad_entries() {
        let sys = build_system_data(&accelerator_cm(), &service_class_cm(), OptimizerMode::Unlimited);
        assert_eq!(sys.accelerators.len(), 2);
        assert_eq!(sys.accelerator("A100").unwrap().cost, 40.0);
        assert_eq!(sys.accelerator("MI300X").unwrap().multiplicity, 2);
        assert_eq!(sys.service_classes.len(), 2);
        let premium = &sys.service_classes["Premium"];
        assert_eq!(premium.target("llama").unwrap().slo_itl, 50.0);
        assert!(sys.servers.is_empty());
    }

    #[test]
    fn test_find_model_slo() {
        let cm = service_class_cm();
        let (entry, class) = find_model_slo(&cm, "premium", "llama").unwrap();
        assert_eq!(class, "Premium");
        assert_eq!(entry.slo_tpot, 50.0);

        assert_eq!(
            find_model_slo(&cm, "premium", "granite"),
            Err(ConfigError::MissingSlo("granite".to_string()))
        );
        // Unknown key falls back to searching all classes.
        assert_eq!(find_model_slo(&cm, "gold", "granite").unwrap().1, "Freemium");
        assert!(matches!(
            find_model_slo(&cm, "bad", "llama"),
            Err(ConfigError::InvalidServiceClass { .. })
        ));
    }

    #[test]
    fn test_variant_profile() {
        let p = variant_profile(&variant("a", "prod", "llama")).unwrap();
        assert_eq!(p.decode, DecodeParams { alpha: 10.0, beta: 2.0 });
        assert_eq!(p.max_batch_size, 4);
        assert_eq!(p.accelerator_count, 1);

        let mut broken = variant("b", "prod", "llama");
        broken.spec.variant_profile.perf_parms.decode_parms.remove("beta");
        assert!(matches!(
            variant_profile(&broken),
            Err(ConfigError::MissingCoefficients { phase: "decode", .. })
        ));
    }

    #[test]
    fn test_same_accelerator_variants_keep_own_profiles() {
        let mut sys = build_system_data(&accelerator_cm(), &service_class_cm(), OptimizerMode::Unlimited);
        let mut one = with_alloc(variant("one", "prod", "llama"), 1);
        one.spec.keep_accelerator = false;
        let mut two = with_alloc(variant("two", "prod", "llama"), 1);
        two.spec.keep_accelerator = false;
        two.spec.variant_id = "llama-A100-2".to_string();
        two.spec.accelerator_count = 2;
        two.spec.variant_profile.perf_parms.decode_parms.insert("alpha".to_string(), "5".to_string());

        for va in [&one, &two] {
            add_server(&mut sys, va, variant_profile(va).unwrap(), "Premium", 1).unwrap();
        }
        assert_eq!(sys.profiles["llama"].len(), 2);

        let out = Optimizer::new().optimize(&sys).unwrap();
        assert_eq!(out.solution.get("one:prod").unwrap().cost, 40.0);
        assert_eq!(out.solution.get("two:prod").unwrap().cost, 80.0);
    }

    #[test]
    fn test_add_server_requires_allocation() {
        let mut sys = SystemModel::default();
        let va = variant("a", "prod", "llama");
        assert_eq!(
            add_server(&mut sys, &va, variant_profile(&va).unwrap(), "Premium", 1),
            Err(ConfigError::NoCurrentAllocation("a".to_string()))
        );
        assert!(sys.profiles.is_empty());
    }

    #[test]
    fn test_add_server_parses_status() {
        let mut sys = SystemModel::default();
        let mut va = variant("a", "prod", "llama");
        va.status.load = LoadProfile {
            arrival_rate: "60.00".to_string(),
            avg_input_tokens: "1e3".to_string(),
            avg_output_tokens: "100.00".to_string(),
        };
        va.status.itl_average = "NaN".to_string();
        va.status.current_allocs = vec![Allocation {
            variant_id: "llama-A100-1".to_string(),
            accelerator: "A100".to_string(),
            num_replicas: 2,
            max_batch: 4,
            variant_cost: "80.00".to_string(),
        }];
        add_server(&mut sys, &va, variant_profile(&va).unwrap(), "Premium", 0).unwrap();

        let s = &sys.servers["a:prod"];
        assert_eq!(s.current.load, LoadObservation::new(60.0, 0.0, 100.0));
        assert_eq!(s.current.cost, 80.0);
        assert_eq!(s.current.itl_average, 0.0);
        assert_eq!(s.min_num_replicas, 0);
        assert!(s.keep_accelerator);
        assert_eq!(s.class, "Premium");
        assert!(sys.own_profile(s).is_some());
    }

    #[test]
    fn test_min_replicas() {
        let cache = MetricsCache::new();
        let mut va = variant("a", "prod", "llama");

        // Controller default applies when the variant is silent.
        assert_eq!(min_replicas(&va, &defaults(false), &Freshness::Missing), 1);
        assert_eq!(min_replicas(&va, &defaults(true), &Freshness::Missing), 0);

        // Variant override wins.
        va.spec.scale_to_zero = Some(ScaleToZeroSpec {
            enabled: false,
            retention_period_secs: None,
        });
        assert_eq!(min_replicas(&va, &defaults(true), &Freshness::Missing), 1);

        // With a retention period only a fresh, idle, full window allows zero.
        va.spec.scale_to_zero = Some(ScaleToZeroSpec {
            enabled: true,
            retention_period_secs: Some(300),
        });
        assert_eq!(min_replicas(&va, &defaults(false), &Freshness::Missing), 1);

        cache.put("llama", LoadObservation::default(), Duration::from_secs(600), Some(0.0), t0());
        assert_eq!(min_replicas(&va, &defaults(false), &cache.lookup("llama", t0())), 0);

        // An unknown request count never proves the window idle.
        cache.put("llama", LoadObservation::default(), Duration::from_secs(600), None, t0());
        assert_eq!(min_replicas(&va, &defaults(false), &cache.lookup("llama", t0())), 1);

        cache.put("llama", LoadObservation::default(), Duration::from_secs(120), Some(0.0), t0());
        assert_eq!(min_replicas(&va, &defaults(false), &cache.lookup("llama", t0())), 1);

        cache.put("llama", LoadObservation::new(5.0, 0.0, 0.0), Duration::from_secs(600), Some(3.0), t0());
        assert_eq!(min_replicas(&va, &defaults(false), &cache.lookup("llama", t0())), 1);
    }

    #[test]
    fn test_create_optimized_alloc() {
        let mut sys = build_system_data(&accelerator_cm(), &service_class_cm(), OptimizerMode::Unlimited);
        let mut va = variant("a", "prod", "llama");
        va.status.load = load_profile(&LoadObservation::new(60.0, 0.0, 100.0));
        va.status.current_allocs = vec![Allocation {
            variant_id: "llama-A100-1".to_string(),
            accelerator: "A100".to_string(),
            num_replicas: 1,
            max_batch: 4,
            variant_cost: "40.00".to_string(),
        }];
        add_server(&mut sys, &va, variant_profile(&va).unwrap(), "Premium", 1).unwrap();

        let out = Optimizer::new().optimize(&sys).unwrap();
        let alloc = create_optimized_alloc(&va, &out.solution, t0()).unwrap();
        assert_eq!(alloc.accelerator, "A100");
        assert_eq!(alloc.num_replicas, 1);
        assert_eq!(alloc.last_run_time, t0());

        let other = variant("b", "prod", "llama");
        assert!(create_optimized_alloc(&other, &out.solution, t0()).is_none());
    }

    #[test]
    fn test_load_profile_formatting() {
        let p = load_profile(&LoadObservation::default());
        assert_eq!(p.arrival_rate, "0.00");
        assert_eq!(p.avg_input_tokens, "0.00");
        assert_eq!(p.avg_output_tokens, "0.00");
    }
}
