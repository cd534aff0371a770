use std::collections::BTreeMap;

/// Malformed operator input. Fails only the variant it belongs to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{phase} parameters need {required} coefficients, found {found}")]
    MissingCoefficients {
        phase: &'static str,
        required: usize,
        found: usize,
    },

    #[error("{phase} coefficient {name:?} is missing")]
    MissingCoefficient {
        phase: &'static str,
        name: &'static str,
    },

    #[error("{phase} coefficient {name:?} has invalid value {value:?}")]
    InvalidCoefficient {
        phase: &'static str,
        name: &'static str,
        value: String,
    },

    #[error("model {0:?} not found in any service class")]
    MissingSlo(String),

    #[error("service class {key:?} is invalid: {reason}")]
    InvalidServiceClass { key: String, reason: String },

    #[error("no current allocation found for variant {0}")]
    NoCurrentAllocation(String),
}

/// Why a single server could not be allocated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServerError {
    #[error("accelerator {0:?} is not configured")]
    UnknownAccelerator(String),

    #[error("no performance profile for model {model:?} on accelerator {accelerator:?}")]
    MissingProfile { model: String, accelerator: String },

    #[error("service class {class:?} is not configured")]
    UnknownServiceClass { class: String },

    #[error("service class {class:?} has no target for model {model:?}")]
    MissingTarget { class: String, model: String },

    #[error("no accelerator satisfies the SLO within {ceiling} replicas")]
    Infeasible { ceiling: u32 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimizeError {
    #[error("no feasible allocations found for all variants")]
    NoFeasibleAllocation {
        failures: BTreeMap<String, ServerError>,
    },

    #[error("capacity-constrained optimization is not supported")]
    CapacityModeUnsupported,
}
