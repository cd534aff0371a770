pub mod cluster;
pub mod condition;
pub mod config_map;
pub mod variant;

pub use cluster::{DeploymentInfo, NodeInfo};
pub use condition::{
    find_condition, set_condition, Condition, ConditionReason, ConditionStatus, ConditionType,
};
pub use config_map::{AcceleratorCostEntry, ConfigMap, ServiceClassConfig, ServiceClassEntry};
pub use variant::{
    full_name, Allocation, ActuationStatus, ConfigMapKeyRef, LoadProfile, OptimizedAlloc,
    PerfParms, ScaleToZeroSpec, VariantAutoscaling, VariantAutoscalingSpec,
    VariantAutoscalingStatus, VariantProfile,
};

pub mod telemetry;
