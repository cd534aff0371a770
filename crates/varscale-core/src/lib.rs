//! Allocation core: latency model, load cache, system model and optimizer.

pub mod error;
pub mod metrics_cache;
pub mod numeric;
pub mod perf;
pub mod solver;
pub mod system;

pub use error::{ConfigError, OptimizeError, ServerError};
pub use metrics_cache::{CachedMetrics, Freshness, MetricsCache};
pub use perf::{DecodeParams, PerfProfile, Prediction, PrefillParams};
pub use solver::{
    AllocationDecision, AllocationSolution, Optimization, Optimizer, DEFAULT_SEARCH_CEILING,
};
pub use system::{
    AcceleratorSpec, CurrentAllocation, LoadObservation, ModelTarget, OptimizerMode, ServerEntry,
    ServiceClass, SystemModel,
};
