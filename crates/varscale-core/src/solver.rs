//! Allocation optimizer.
//!
//! In unlimited mode every server is solved independently: pick the
//! cheapest (accelerator, replicas) pair whose predicted latency meets the
//! server's service class target. The solver is synchronous, does no I/O
//! and is deterministic for a given [`SystemModel`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OptimizeError, ServerError};
use crate::perf::{PerfProfile, Prediction};
use crate::system::{AcceleratorSpec, LoadObservation, ModelTarget, OptimizerMode, ServerEntry, SystemModel};

pub const DEFAULT_SEARCH_CEILING: u32 = 1000;

/// Target allocation for one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllocationDecision {
    pub accelerator: String,
    pub num_replicas: u32,
    /// Total cost of all replicas.
    pub cost: f64,
    /// Predicted per-replica batch size, ITL and TTFT at `num_replicas`.
    pub batch_size: f64,
    pub itl: f64,
    pub ttft: f64,
}

/// Decisions keyed by server identity (`name:namespace`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AllocationSolution {
    decisions: BTreeMap<String, AllocationDecision>,
}

impl AllocationSolution {
    pub fn get(&self, server: &str) -> Option<&AllocationDecision> {
        self.decisions.get(server)
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AllocationDecision)> {
        self.decisions.iter()
    }

    pub fn total_cost(&self) -> f64 {
        self.decisions.values().map(|d| d.cost).sum()
    }

    fn insert(&mut self, server: String, decision: AllocationDecision) {
        self.decisions.insert(server, decision);
    }
}

/// Result of a successful run: the solution plus the servers that could
/// not be allocated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Optimization {
    pub solution: AllocationSolution,
    pub failures: BTreeMap<String, ServerError>,
}

#[derive(Debug, Clone, Copy)]
pub struct Optimizer {
    search_ceiling: u32,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self {
            search_ceiling: DEFAULT_SEARCH_CEILING,
        }
    }

    pub fn with_search_ceiling(mut self, ceiling: u32) -> Self {
        self.search_ceiling = ceiling.max(1);
        self
    }

    pub fn search_ceiling(&self) -> u32 {
        self.search_ceiling
    }

    /// Solve every server in `system`.
    ///
    /// Per-server failures are collected in [`Optimization::failures`];
    /// the call itself only fails when nothing could be allocated.
    pub fn optimize(&self, system: &SystemModel) -> Result<Optimization, OptimizeError> {
        if system.mode == OptimizerMode::Limited {
            return Err(OptimizeError::CapacityModeUnsupported);
        }

        let mut out = Optimization::default();
        for (name, server) in &system.servers {
            match self.solve_server(system, server) {
                Ok(decision) => {
                    tracing::debug!(
                        server = %name,
                        accelerator = %decision.accelerator,
                        replicas = decision.num_replicas,
                        cost = decision.cost,
                        "server allocated"
                    );
                    out.solution.insert(name.clone(), decision);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "server allocation failed");
                    out.failures.insert(name.clone(), e);
                }
            }
        }

        if out.solution.is_empty() {
            return Err(OptimizeError::NoFeasibleAllocation {
                failures: out.failures,
            });
        }
        Ok(out)
    }

    /// Cheapest feasible allocation for one server.
    pub fn solve_server(
        &self,
        system: &SystemModel,
        server: &ServerEntry,
    ) -> Result<AllocationDecision, ServerError> {
        let class = system
            .service_classes
            .get(&server.class)
            .ok_or_else(|| ServerError::UnknownServiceClass {
                class: server.class.clone(),
            })?;
        let target = class
            .target(&server.model)
            .ok_or_else(|| ServerError::MissingTarget {
                class: server.class.clone(),
                model: server.model.clone(),
            })?;

        let candidates = system.candidate_profiles(server);
        if candidates.is_empty() {
            return Err(ServerError::MissingProfile {
                model: server.model.clone(),
                accelerator: server.current.accelerator.clone(),
            });
        }

        let mut best: Option<AllocationDecision> = None;
        let mut first_error: Option<ServerError> = None;
        let mut searched = false;

        for profile in candidates {
            let acc_name = profile.accelerator.as_str();
            let Some(accelerator) = system.accelerator(acc_name) else {
                first_error.get_or_insert(ServerError::UnknownAccelerator(acc_name.to_string()));
                continue;
            };
            searched = true;

            let Some((replicas, prediction)) = self.search_replicas(
                profile,
                &server.current.load,
                target,
                server.min_num_replicas,
            ) else {
                tracing::debug!(
                    model = %server.model,
                    accelerator = %acc_name,
                    "no feasible replica count"
                );
                continue;
            };

            let candidate = AllocationDecision {
                accelerator: acc_name.to_string(),
                num_replicas: replicas,
                cost: f64::from(replicas) * replica_cost(accelerator, profile),
                batch_size: prediction.batch_size,
                itl: prediction.itl,
                ttft: prediction.ttft,
            };
            best = match best {
                Some(cur) if prefer(&cur, &candidate, &server.current.accelerator) != Ordering::Greater => Some(cur),
                _ => Some(candidate),
            };
        }

        match (best, first_error) {
            (Some(decision), _) => Ok(decision),
            (None, Some(e)) if !searched => Err(e),
            _ => Err(ServerError::Infeasible {
                ceiling: self.search_ceiling,
            }),
        }
    }

    /// Smallest `N >= min_replicas` meeting the target, with its prediction.
    ///
    /// Feasibility is monotone in `N` (more replicas, less load each), so
    /// after the floor fails a binary search up to the ceiling is exact.
    pub fn search_replicas(
        &self,
        profile: &PerfProfile,
        load: &LoadObservation,
        target: &ModelTarget,
        min_replicas: u32,
    ) -> Option<(u32, Prediction)> {
        if min_replicas == 0 && load.is_idle() {
            return Some((
                0,
                Prediction {
                    batch_size: 0.0,
                    itl: 0.0,
                    ttft: 0.0,
                },
            ));
        }

        let floor = min_replicas.max(1);
        if floor > self.search_ceiling {
            return None;
        }
        if let Some(p) = feasible(profile, load, target, floor) {
            return Some((floor, p));
        }

        let mut lo = floor;
        let mut hi = self.search_ceiling;
        let mut found = feasible(profile, load, target, hi)?;
        // Invariant: lo infeasible, hi feasible.
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            match feasible(profile, load, target, mid) {
                Some(p) => {
                    hi = mid;
                    found = p;
                }
                None => lo = mid,
            }
        }
        Some((hi, found))
    }
}

fn feasible(
    profile: &PerfProfile,
    load: &LoadObservation,
    target: &ModelTarget,
    replicas: u32,
) -> Option<Prediction> {
    let p = profile.predict(load, replicas)?;
    if p.batch_size > f64::from(profile.max_batch_size) {
        return None;
    }
    target.is_met_by(p.itl, p.ttft).then_some(p)
}

/// Cost of one replica of `profile` on `accelerator`.
pub fn replica_cost(accelerator: &AcceleratorSpec, profile: &PerfProfile) -> f64 {
    accelerator.cost * f64::from(accelerator.multiplicity) * f64::from(profile.accelerator_count)
}

/// Order two candidates; `Less` means `a` wins.
fn prefer(a: &AllocationDecision, b: &AllocationDecision, current: &str) -> Ordering {
    a.cost
        .total_cmp(&b.cost)
        .then_with(|| (a.accelerator != current).cmp(&(b.accelerator != current)))
        .then_with(|| a.num_replicas.cmp(&b.num_replicas))
        .then_with(|| a.accelerator.cmp(&b.accelerator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::{DecodeParams, PrefillParams};
    use crate::system::{CurrentAllocation, ServiceClass};

    fn accelerator(name: &str, cost: f64) -> AcceleratorSpec {
        AcceleratorSpec {
            name: name.to_string(),
            device: "nvidia.com/gpu".to_string(),
            cost,
            multiplicity: 1,
        }
    }

    fn profile(acc: &str, alpha: f64) -> PerfProfile {
        PerfProfile {
            model: "llama".to_string(),
            accelerator: acc.to_string(),
            accelerator_count: 1,
            max_batch_size: 4,
            decode: DecodeParams { alpha, beta: 2.0 },
            prefill: PrefillParams { gamma: 5.0, delta: 0.0 },
        }
    }

    const SERVER: &str = "llama-a100:prod";

    fn server(rate: f64, acc: &str, keep: bool, min: u32) -> ServerEntry {
        ServerEntry {
            name: SERVER.to_string(),
            variant_id: "llama-A100-1".to_string(),
            model: "llama".to_string(),
            class: "Premium".to_string(),
            current: CurrentAllocation {
                accelerator: acc.to_string(),
                num_replicas: 1,
                load: LoadObservation::new(rate, 0.0, 100.0),
                ..CurrentAllocation::default()
            },
            min_num_replicas: min,
            keep_accelerator: keep,
        }
    }

    fn system(rate: f64) -> SystemModel {
        let mut sys = SystemModel::new(OptimizerMode::Unlimited);
        sys.add_accelerator(accelerator("A100", 40.0));
        sys.add_profile(SERVER, profile("A100", 10.0));
        sys.add_service_class(ServiceClass {
            name: "Premium".to_string(),
            priority: 1,
            targets: vec![ModelTarget {
                model: "llama".to_string(),
                slo_itl: 50.0,
                slo_ttft: 0.0,
            }],
        });
        sys.add_server(server(rate, "A100", false, 1));
        sys
    }

    #[test]
    fn test_single_replica_at_low_load() {
        let out = Optimizer::new().optimize(&system(60.0)).unwrap();
        let d = out.solution.get(SERVER).unwrap();
        assert_eq!(d.accelerator, "A100");
        assert_eq!(d.num_replicas, 1);
        assert_eq!(d.cost, 40.0);
        assert!(d.batch_size <= 4.0);
        assert!(out.failures.is_empty());
    }

    #[test]
    fn test_higher_load_needs_more_replicas() {
        // One replica would run a batch of ~20; two bring it to ~3.35.
        let out = Optimizer::new().optimize(&system(240.0)).unwrap();
        let d = out.solution.get(SERVER).unwrap();
        assert_eq!(d.num_replicas, 2);
        assert_eq!(d.cost, 80.0);
        assert!(d.itl <= 50.0);
    }

    #[test]
    fn test_binary_search_finds_minimum() {
        let sys = system(6000.0);
        let opt = Optimizer::new();
        let d = opt.optimize(&sys).unwrap().solution.get(SERVER).cloned().unwrap();
        let server = &sys.servers[SERVER];
        let p = sys.profile("llama", SERVER).unwrap();
        let t = sys.target_for(server).unwrap();
        assert!(feasible(p, &server.current.load, t, d.num_replicas).is_some());
        assert!(feasible(p, &server.current.load, t, d.num_replicas - 1).is_none());
    }

    #[test]
    fn test_cheaper_accelerator_chosen() {
        let mut sys = system(60.0);
        sys.add_accelerator(accelerator("L40S", 20.0));
        sys.add_profile("llama-l40s:prod", profile("L40S", 12.0));
        let d = Optimizer::new().optimize(&sys).unwrap().solution.get(SERVER).cloned().unwrap();
        assert_eq!(d.accelerator, "L40S");
        assert_eq!(d.cost, 20.0);
    }

    #[test]
    fn test_keep_accelerator_retains_current() {
        let mut sys = system(60.0);
        sys.add_accelerator(accelerator("L40S", 20.0));
        sys.add_profile("llama-l40s:prod", profile("L40S", 12.0));
        sys.add_server(server(60.0, "A100", true, 1));
        let d = Optimizer::new().optimize(&sys).unwrap().solution.get(SERVER).cloned().unwrap();
        assert_eq!(d.accelerator, "A100");
        assert_eq!(d.num_replicas, 1);
    }

    #[test]
    fn test_tie_prefers_current_accelerator() {
        let mut sys = system(60.0);
        sys.add_accelerator(accelerator("H100", 40.0));
        sys.add_profile(SERVER, profile("H100", 10.0));
        sys.add_profile("llama-b:prod", profile("A100", 10.0));
        // Name order alone would pick A100.
        sys.add_server(server(60.0, "H100", false, 1));
        let d = Optimizer::new().optimize(&sys).unwrap().solution.get(SERVER).cloned().unwrap();
        assert_eq!(d.accelerator, "H100");
    }

    #[test]
    fn test_scale_to_zero_when_idle() {
        let mut sys = system(0.0);
        sys.add_server(server(0.0, "A100", false, 0));
        let d = Optimizer::new().optimize(&sys).unwrap().solution.get(SERVER).cloned().unwrap();
        assert_eq!(d.num_replicas, 0);
        assert_eq!(d.cost, 0.0);

        // Floor of one keeps a replica even without traffic.
        let d = Optimizer::new().optimize(&system(0.0)).unwrap().solution.get(SERVER).cloned().unwrap();
        assert_eq!(d.num_replicas, 1);
    }

    #[test]
    fn test_min_replicas_respected() {
        let mut sys = system(60.0);
        sys.add_server(server(60.0, "A100", false, 3));
        let d = Optimizer::new().optimize(&sys).unwrap().solution.get(SERVER).cloned().unwrap();
        assert_eq!(d.num_replicas, 3);
    }

    #[test]
    fn test_search_ceiling_at_least_one() {
        assert_eq!(Optimizer::new().search_ceiling(), DEFAULT_SEARCH_CEILING);
        assert_eq!(Optimizer::new().with_search_ceiling(0).search_ceiling(), 1);
        assert_eq!(Optimizer::new().with_search_ceiling(5).search_ceiling(), 5);
    }

    #[test]
    fn test_infeasible_within_ceiling() {
        let sys = system(6000.0);
        let err = Optimizer::new().with_search_ceiling(5).optimize(&sys).unwrap_err();
        match err {
            OptimizeError::NoFeasibleAllocation { failures } => {
                assert_eq!(failures[SERVER], ServerError::Infeasible { ceiling: 5 });
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_alpha_above_slo_is_infeasible() {
        let mut sys = system(60.0);
        sys.add_profile(SERVER, profile("A100", 60.0));
        assert!(matches!(
            Optimizer::new().optimize(&sys),
            Err(OptimizeError::NoFeasibleAllocation { .. })
        ));
    }

    #[test]
    fn test_partial_failure_is_reported() {
        let mut sys = system(60.0);
        let mut orphan = server(60.0, "A100", false, 1);
        orphan.name = "other:prod".to_string();
        orphan.model = "unknown-model".to_string();
        sys.add_server(orphan);

        let out = Optimizer::new().optimize(&sys).unwrap();
        assert_eq!(out.solution.len(), 1);
        assert_eq!(
            out.failures["other:prod"],
            ServerError::MissingTarget {
                class: "Premium".to_string(),
                model: "unknown-model".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_class_and_accelerator() {
        let mut sys = system(60.0);
        let mut s = server(60.0, "A100", false, 1);
        s.class = "Bronze".to_string();
        assert!(matches!(
            Optimizer::new().solve_server(&sys, &s),
            Err(ServerError::UnknownServiceClass { .. })
        ));

        sys.add_profile(SERVER, profile("TPU", 10.0));
        let s = server(60.0, "TPU", true, 1);
        assert_eq!(
            Optimizer::new().solve_server(&sys, &s),
            Err(ServerError::UnknownAccelerator("TPU".to_string()))
        );
    }

    #[test]
    fn test_empty_system_fails() {
        let sys = SystemModel::new(OptimizerMode::Unlimited);
        assert_eq!(
            Optimizer::new().optimize(&sys),
            Err(OptimizeError::NoFeasibleAllocation {
                failures: BTreeMap::new()
            })
        );
    }

    #[test]
    fn test_limited_mode_unsupported() {
        let mut sys = system(60.0);
        sys.mode = OptimizerMode::Limited;
        assert_eq!(
            Optimizer::new().optimize(&sys),
            Err(OptimizeError::CapacityModeUnsupported)
        );
    }

    #[test]
    fn test_deterministic() {
        let mut sys = system(500.0);
        sys.add_accelerator(accelerator("L40S", 20.0));
        sys.add_profile("llama-l40s:prod", profile("L40S", 12.0));
        let a = Optimizer::new().optimize(&sys).unwrap();
        let b = Optimizer::new().optimize(&sys).unwrap();
        assert_eq!(
            serde_json::to_string(&a.solution).unwrap(),
            serde_json::to_string(&b.solution).unwrap()
        );
    }

    #[test]
    fn test_same_accelerator_variants_keep_own_profiles() {
        let mut sys = system(60.0);
        sys.profiles.clear();
        sys.servers.clear();

        let mut one = server(60.0, "A100", false, 1);
        one.name = "one:prod".to_string();
        let mut two = server(60.0, "A100", false, 1);
        two.name = "two:prod".to_string();
        two.variant_id = "llama-A100-2".to_string();
        let mut doubled = profile("A100", 5.0);
        doubled.accelerator_count = 2;

        sys.add_profile("one:prod", profile("A100", 10.0));
        sys.add_server(one);
        sys.add_profile("two:prod", doubled);
        sys.add_server(two);

        let out = Optimizer::new().optimize(&sys).unwrap();
        let one = out.solution.get("one:prod").unwrap();
        let two = out.solution.get("two:prod").unwrap();
        assert_eq!((one.num_replicas, one.cost), (1, 40.0));
        assert_eq!((two.num_replicas, two.cost), (1, 80.0));
        assert!(one.itl > two.itl);
        assert_eq!(out.solution.total_cost(), 120.0);
    }

    #[test]
    fn test_missing_own_profile() {
        let mut sys = system(60.0);
        sys.profiles.clear();
        sys.add_profile("other:prod", profile("A100", 10.0));
        assert_eq!(
            Optimizer::new().solve_server(&sys, &sys.servers[SERVER]),
            Err(ServerError::MissingProfile {
                model: "llama".to_string(),
                accelerator: "A100".to_string()
            })
        );
    }

    #[test]
    fn test_replica_cost_uses_multiplicity_and_count() {
        let mut acc = accelerator("MI300X", 10.0);
        acc.multiplicity = 2;
        let mut p = profile("MI300X", 10.0);
        p.accelerator_count = 4;
        assert_eq!(replica_cost(&acc, &p), 80.0);
    }
}
