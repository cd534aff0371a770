use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;

use varscale_controller::actuator::ReplicaGauges;
use varscale_controller::args::Args;
use varscale_controller::collector::{self, MetricsSource, PrometheusClient};
use varscale_controller::config::ControllerConfig;
use varscale_controller::metrics::{healthz_handler, metrics_handler, AppState, SharedMetrics};
use varscale_controller::reconcile::{reconcile_loop, Reconciler};
use varscale_controller::retry::Backoff;
use varscale_meta::{EtcdBackend, KvBackend, MemoryBackend, ResourceStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (_otel_guard, log_level) = varscale_common::telemetry::init_tracing(
        "varscale-controller",
        &args.log_level,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );
    tracing::info!("varscale-controller starting...");

    let backend: Arc<dyn KvBackend> = if args.in_memory_store {
        tracing::warn!("using in-memory resource store, state is lost on exit");
        Arc::new(MemoryBackend::new())
    } else {
        let etcd = EtcdBackend::connect(std::slice::from_ref(&args.etcd_endpoint)).await?;
        tracing::info!(endpoint=%args.etcd_endpoint, "connected to etcd");
        Arc::new(etcd)
    };
    let store = ResourceStore::new(backend);

    let source: Option<Arc<dyn MetricsSource>> = match args.prometheus_url.as_deref() {
        Some(url) => {
            let client = PrometheusClient::new(
                url,
                args.prometheus_token.clone(),
                Duration::from_secs(args.query_timeout_secs.max(1)),
            )?;
            collector::validate(&client, Backoff::PROMETHEUS)
                .await
                .with_context(|| format!("prometheus at {url} is unreachable"))?;
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("prometheus_url not set, variants will report MetricsMissing");
            None
        }
    };

    let config = ControllerConfig::from_args(&args);
    let metrics = Arc::new(SharedMetrics::default());
    let gauges = ReplicaGauges::new();

    let reconciler = Arc::new(
        Reconciler::new(store, source, config, metrics.clone(), gauges.clone()).with_log_level(log_level),
    );
    tokio::spawn(reconcile_loop(reconciler));

    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { metrics, gauges });

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr=%args.listen_addr, "serving /metrics and /healthz");
    axum::serve(listener, app).await?;
    Ok(())
}
