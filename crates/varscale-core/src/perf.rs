//! Closed-form latency predictors.
//!
//! Decode: `itl = alpha + beta * batch`.
//! Prefill: `ttft = gamma + delta * input_tokens * batch`.
//!
//! All latencies are in milliseconds, arrival rates in requests per minute.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::system::LoadObservation;

const MS_PER_MINUTE: f64 = 60_000.0;

pub fn itl(alpha: f64, beta: f64, batch_size: f64) -> f64 {
    alpha + beta * batch_size
}

pub fn ttft(gamma: f64, delta: f64, avg_input_tokens: f64, batch_size: f64) -> f64 {
    gamma + delta * avg_input_tokens * batch_size
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DecodeParams {
    pub alpha: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PrefillParams {
    pub gamma: f64,
    pub delta: f64,
}

impl DecodeParams {
    const PHASE: &'static str = "decode";

    /// Build from the `{"alpha": .., "beta": ..}` string map of a variant profile.
    pub fn from_map(parms: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        require_len(Self::PHASE, parms)?;
        Ok(Self {
            alpha: coefficient(Self::PHASE, parms, "alpha")?,
            beta: coefficient(Self::PHASE, parms, "beta")?,
        })
    }

    pub fn itl(&self, batch_size: f64) -> f64 {
        itl(self.alpha, self.beta, batch_size)
    }
}

impl PrefillParams {
    const PHASE: &'static str = "prefill";

    /// Build from the `{"gamma": .., "delta": ..}` string map of a variant profile.
    pub fn from_map(parms: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        require_len(Self::PHASE, parms)?;
        Ok(Self {
            gamma: coefficient(Self::PHASE, parms, "gamma")?,
            delta: coefficient(Self::PHASE, parms, "delta")?,
        })
    }

    pub fn ttft(&self, avg_input_tokens: f64, batch_size: f64) -> f64 {
        ttft(self.gamma, self.delta, avg_input_tokens, batch_size)
    }
}

fn require_len(phase: &'static str, parms: &BTreeMap<String, String>) -> Result<(), ConfigError> {
    if parms.len() < 2 {
        return Err(ConfigError::MissingCoefficients {
            phase,
            required: 2,
            found: parms.len(),
        });
    }
    Ok(())
}

fn coefficient(
    phase: &'static str,
    parms: &BTreeMap<String, String>,
    name: &'static str,
) -> Result<f64, ConfigError> {
    let raw = parms
        .get(name)
        .ok_or(ConfigError::MissingCoefficient { phase, name })?;
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(ConfigError::InvalidCoefficient {
            phase,
            name,
            value: raw.clone(),
        }),
    }
}

/// Performance profile of a model on one accelerator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerfProfile {
    pub model: String,
    pub accelerator: String,
    /// Accelerator units per replica.
    pub accelerator_count: u32,
    pub max_batch_size: u32,
    pub decode: DecodeParams,
    pub prefill: PrefillParams,
}

/// Predicted steady state of one replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    /// Average number of requests in flight on the replica.
    pub batch_size: f64,
    pub itl: f64,
    pub ttft: f64,
}

impl PerfProfile {
    /// Predict per-replica latency when `load` is spread evenly over
    /// `replicas` replicas.
    ///
    /// The in-flight batch follows Little's law,
    /// `B = λ·(ttft(B) + out·itl(B))`, which is linear in `B` and solves to
    /// `B = λ·(γ + out·α) / (1 − λ·(δ·in + out·β))`. Returns `None` when the
    /// replica cannot keep up (non-positive denominator) or `replicas` is 0.
    pub fn predict(&self, load: &LoadObservation, replicas: u32) -> Option<Prediction> {
        if replicas == 0 {
            return None;
        }
        let rate = load.arrival_rate / f64::from(replicas) / MS_PER_MINUTE;
        let input = load.avg_input_tokens;
        let output = load.avg_output_tokens;

        let base = self.prefill.gamma + output * self.decode.alpha;
        let slope = self.prefill.delta * input + output * self.decode.beta;
        let headroom = 1.0 - rate * slope;
        if headroom <= 0.0 {
            return None;
        }

        let batch_size = rate * base / headroom;
        if !batch_size.is_finite() {
            return None;
        }
        Some(Prediction {
            batch_size,
            itl: self.decode.itl(batch_size),
            ttft: self.prefill.ttft(input, batch_size),
        })
    }
}
