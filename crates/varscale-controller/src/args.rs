use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "varscale-controller", about = "SLO-driven replica and accelerator optimizer")]
pub struct Args {
    #[arg(long, env = "VARSCALE_LISTEN_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    #[arg(long, env = "ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Keep resources in process memory instead of etcd.
    #[arg(long, env = "VARSCALE_IN_MEMORY_STORE")]
    pub in_memory_store: bool,

    /// Prometheus base URL (e.g. "http://prometheus:9090"). Without it no
    /// load can be observed and every variant reports MetricsMissing.
    #[arg(long, env = "PROMETHEUS_URL")]
    pub prometheus_url: Option<String>,

    #[arg(long, env = "PROMETHEUS_BEARER_TOKEN")]
    pub prometheus_token: Option<String>,

    /// Namespace holding the controller's configmaps.
    #[arg(long, env = "VARSCALE_NAMESPACE", default_value = "varscale-system")]
    pub config_namespace: String,

    #[arg(long, default_value = "accelerator-unit-costs")]
    pub accelerator_config_map: String,

    #[arg(long, default_value = "service-classes-config")]
    pub service_class_config_map: String,

    #[arg(long, default_value = "varscale-config")]
    pub defaults_config_map: String,

    #[arg(long, env = "VARSCALE_RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub reconcile_interval_secs: u64,

    /// Window over which cached load stays fresh and total requests are counted.
    #[arg(long, env = "VARSCALE_METRICS_RETENTION_SECS", default_value_t = 600)]
    pub metrics_retention_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub query_timeout_secs: u64,

    /// Controller-wide scale-to-zero default; variants may override it.
    #[arg(long, env = "VARSCALE_SCALE_TO_ZERO")]
    pub scale_to_zero: bool,

    /// debug | info | warn | error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Largest replica count the optimizer will consider per variant.
    #[arg(long, default_value_t = varscale_core::DEFAULT_SEARCH_CEILING)]
    pub search_ceiling: u32,

    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
