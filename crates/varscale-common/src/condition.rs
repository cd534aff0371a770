use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Whether serving metrics could be retrieved for the variant.
    MetricsAvailable,
    /// Whether the optimizer produced an allocation for the variant.
    OptimizationReady,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionReason {
    // MetricsAvailable
    MetricsFound,
    MetricsMissing,
    MetricsStale,
    PrometheusError,

    // OptimizationReady
    OptimizationSucceeded,
    OptimizationFailed,
    MetricsUnavailable,
}

impl ConditionReason {
    /// The condition type this reason belongs to.
    pub fn condition_type(&self) -> ConditionType {
        match self {
            ConditionReason::MetricsFound
            | ConditionReason::MetricsMissing
            | ConditionReason::MetricsStale
            | ConditionReason::PrometheusError => ConditionType::MetricsAvailable,
            ConditionReason::OptimizationSucceeded
            | ConditionReason::OptimizationFailed
            | ConditionReason::MetricsUnavailable => ConditionType::OptimizationReady,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Upsert a condition by type. The transition time only moves when the
/// status actually changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    status: ConditionStatus,
    reason: ConditionReason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let condition_type = reason.condition_type();
    let message = message.into();

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status;
        existing.reason = reason;
        existing.message = message;
        return;
    }

    conditions.push(Condition {
        condition_type,
        status,
        reason,
        message,
        last_transition_time: now,
    });
}

pub fn find_condition(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}
