use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

use crate::actuator::ReplicaGauges;

/// Shared metrics for the controller, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Total number of reconcile cycles.
    pub reconcile_total: AtomicU64,
    /// Cycles that failed or produced no allocation.
    pub reconcile_errors: AtomicU64,
    /// Variants seen in the last cycle (gauge).
    pub variants: AtomicU64,
    /// Variants the optimizer could not place.
    pub optimization_failures_total: AtomicU64,
    /// Failed metric collections.
    pub metrics_query_errors_total: AtomicU64,
    /// Status writes that failed after retries.
    pub status_update_errors_total: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<SharedMetrics>,
    pub gauges: ReplicaGauges,
}

pub fn render_metrics(metrics: &SharedMetrics, gauges: &ReplicaGauges) -> String {
    let mut body = format!(
        "# HELP varscale_reconcile_total Total reconcile cycles.\n\
         # TYPE varscale_reconcile_total counter\n\
         varscale_reconcile_total {}\n\
         # HELP varscale_reconcile_errors Total failed reconcile cycles.\n\
         # TYPE varscale_reconcile_errors counter\n\
         varscale_reconcile_errors {}\n\
         # HELP varscale_variants Variants seen in the last cycle.\n\
         # TYPE varscale_variants gauge\n\
         varscale_variants {}\n\
         # HELP varscale_optimization_failures_total Variants without a feasible allocation.\n\
         # TYPE varscale_optimization_failures_total counter\n\
         varscale_optimization_failures_total {}\n\
         # HELP varscale_metrics_query_errors_total Failed Prometheus metric collections.\n\
         # TYPE varscale_metrics_query_errors_total counter\n\
         varscale_metrics_query_errors_total {}\n\
         # HELP varscale_status_update_errors_total Variant status writes that failed.\n\
         # TYPE varscale_status_update_errors_total counter\n\
         varscale_status_update_errors_total {}\n",
        metrics.reconcile_total.load(Ordering::Relaxed),
        metrics.reconcile_errors.load(Ordering::Relaxed),
        metrics.variants.load(Ordering::Relaxed),
        metrics.optimization_failures_total.load(Ordering::Relaxed),
        metrics.metrics_query_errors_total.load(Ordering::Relaxed),
        metrics.status_update_errors_total.load(Ordering::Relaxed),
    );
    gauges.render(&mut body);
    body
}

/// GET /metrics: Prometheus text exposition format.
pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render_metrics(&st.metrics, &st.gauges),
    )
}

/// GET /healthz: liveness check.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{GaugeKey, ReplicaValues};

    #[test]
    fn test_render_counters_and_gauges() {
        let m = SharedMetrics::default();
        m.reconcile_total.fetch_add(3, Ordering::Relaxed);
        m.variants.store(2, Ordering::Relaxed);
        let g = ReplicaGauges::new();
        g.set(
            GaugeKey {
                variant_name: "a".to_string(),
                namespace: "prod".to_string(),
                variant_id: "llama-A100-1".to_string(),
                accelerator: "A100".to_string(),
            },
            ReplicaValues { current: 1, desired: 2 },
        );

        let body = render_metrics(&m, &g);
        assert!(body.contains("varscale_reconcile_total 3\n"));
        assert!(body.contains("varscale_variants 2\n"));
        assert!(body.contains("varscale_reconcile_errors 0\n"));
        assert!(body.contains("varscale_desired_replicas{variant_name=\"a\""));
    }

    #[test]
    fn test_render_without_variants() {
        let body = render_metrics(&SharedMetrics::default(), &ReplicaGauges::new());
        assert!(body.contains("# TYPE varscale_current_replicas gauge\n"));
        assert!(!body.contains("variant_name="));
    }
}
