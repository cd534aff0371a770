//! Last observed load per model, kept across reconcile cycles.
//!
//! The cache is a passive store: callers supply the window and request
//! count, and decide what a stale entry means for them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

use crate::numeric::sanitize_field;
use crate::system::LoadObservation;

/// Last known load of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMetrics {
    pub observation: LoadObservation,
    /// Window the observation was computed over.
    pub retention: Duration,
    /// Requests seen over `retention`; `None` when the count was not available.
    pub total_requests: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl CachedMetrics {
    /// Stale once `now` is past `updated_at + retention`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match TimeDelta::from_std(self.retention)
            .ok()
            .and_then(|d| self.updated_at.checked_add_signed(d))
        {
            Some(expiry) => now > expiry,
            None => false,
        }
    }

    /// Zero requests were counted over the window. An unknown count is not idle.
    pub fn confirmed_idle(&self) -> bool {
        self.total_requests == Some(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Freshness {
    Fresh(CachedMetrics),
    Stale(CachedMetrics),
    Missing,
}

/// Per-model load observations shared across reconcile cycles.
///
/// Entries are independent; writers to the same model race and the last
/// one wins. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MetricsCache {
    entries: Arc<DashMap<String, CachedMetrics>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        model_id: &str,
        observation: LoadObservation,
        retention: Duration,
        total_requests: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let total_requests = total_requests.map(|n| sanitize_field("total_requests", n).max(0.0));
        self.entries.insert(
            model_id.to_string(),
            CachedMetrics {
                observation,
                retention,
                total_requests,
                updated_at: now,
            },
        );
    }

    /// Most recent entry, regardless of age.
    pub fn get(&self, model_id: &str) -> Option<CachedMetrics> {
        self.entries.get(model_id).map(|e| e.value().clone())
    }

    pub fn lookup(&self, model_id: &str, now: DateTime<Utc>) -> Freshness {
        match self.get(model_id) {
            Some(m) if m.is_stale(now) => Freshness::Stale(m),
            Some(m) => Freshness::Fresh(m),
            None => Freshness::Missing,
        }
    }

    pub fn remove(&self, model_id: &str) -> Option<CachedMetrics> {
        self.entries.remove(model_id).map(|(_, v)| v)
    }

    /// Drop every entry whose model is not in `live`. Returns the number removed.
    pub fn retain_models<F>(&self, mut live: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|model, _| live(model));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
