//! Load and latency observations from Prometheus.
//!
//! One instant query per signal, scoped by `model_name` and `namespace`
//! labels as exported by vLLM. Rates are taken over one minute; the
//! total-request count uses the cache retention window so that "no
//! requests over the full window" can be told apart from "no data".

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use varscale_common::{Allocation, DeploymentInfo, VariantAutoscaling};
use varscale_core::numeric::{format_decimal, sanitize_field};
use varscale_core::LoadObservation;

use crate::retry::{retry, Backoff};

pub const REQUEST_SUCCESS_TOTAL: &str = "vllm:request_success_total";
pub const GENERATION_TOKENS_SUM: &str = "vllm:request_generation_tokens_sum";
pub const GENERATION_TOKENS_COUNT: &str = "vllm:request_generation_tokens_count";
pub const PROMPT_TOKENS_SUM: &str = "vllm:request_prompt_tokens_sum";
pub const PROMPT_TOKENS_COUNT: &str = "vllm:request_prompt_tokens_count";
pub const TTFT_SECONDS_SUM: &str = "vllm:time_to_first_token_seconds_sum";
pub const TTFT_SECONDS_COUNT: &str = "vllm:time_to_first_token_seconds_count";
pub const TPOT_SECONDS_SUM: &str = "vllm:time_per_output_token_seconds_sum";
pub const TPOT_SECONDS_COUNT: &str = "vllm:time_per_output_token_seconds_count";

pub const LABEL_MODEL_NAME: &str = "model_name";
pub const LABEL_NAMESPACE: &str = "namespace";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("query rejected ({error_type}): {error}")]
    Query { error_type: String, error: String },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Request(_) => true,
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::Decode(_) | SourceError::Query { .. } => false,
        }
    }
}

/// One element of an instant-vector result.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Evaluate an instant query. An empty vector is a valid answer.
    async fn query(&self, promql: &str) -> Result<Vec<Sample>, SourceError>;
}

pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl PrometheusClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl MetricsSource for PrometheusClient {
    async fn query(&self, promql: &str) -> Result<Vec<Sample>, SourceError> {
        let mut req = self
            .http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| SourceError::Request(e.to_string()))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| SourceError::Request(e.to_string()))?;

        // Prometheus reports bad queries as 400/422 with a JSON error body.
        if !status.is_success() && status.as_u16() != 400 && status.as_u16() != 422 {
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).chars().take(256).collect(),
            });
        }
        parse_response(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorSample>),
    Scalar((f64, String)),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

/// Decode a `/api/v1/query` body. Sample values that do not parse read as NaN
/// and are sanitized by the caller.
pub fn parse_response(body: &[u8]) -> Result<Vec<Sample>, SourceError> {
    let resp: QueryResponse =
        serde_json::from_slice(body).map_err(|e| SourceError::Decode(e.to_string()))?;

    if resp.status != "success" {
        return Err(SourceError::Query {
            error_type: resp.error_type.unwrap_or_default(),
            error: resp.error.unwrap_or_default(),
        });
    }
    if !resp.warnings.is_empty() {
        tracing::warn!(warnings=?resp.warnings, "prometheus returned warnings");
    }

    let parse = |raw: &str| raw.parse::<f64>().unwrap_or(f64::NAN);
    match resp.data {
        Some(QueryData::Vector(samples)) => Ok(samples
            .into_iter()
            .map(|s| Sample {
                value: parse(&s.value.1),
                labels: s.metric,
            })
            .collect()),
        Some(QueryData::Scalar((_, raw))) => Ok(vec![Sample {
            labels: BTreeMap::new(),
            value: parse(&raw),
        }]),
        Some(QueryData::Matrix(_)) | Some(QueryData::String(_)) => Err(SourceError::Decode(
            "expected an instant vector or scalar".to_string(),
        )),
        None => Ok(Vec::new()),
    }
}

fn selector(metric: &str, model: &str, namespace: &str) -> String {
    format!(r#"{metric}{{{LABEL_MODEL_NAME}="{model}",{LABEL_NAMESPACE}="{namespace}"}}"#)
}

fn ratio_of_rates(sum: &str, count: &str, model: &str, namespace: &str) -> String {
    format!(
        "sum(rate({}[1m]))/sum(rate({}[1m]))",
        selector(sum, model, namespace),
        selector(count, model, namespace)
    )
}

/// Requests per minute.
pub fn arrival_rate_query(model: &str, namespace: &str) -> String {
    format!(
        "sum(rate({}[1m])) * 60",
        selector(REQUEST_SUCCESS_TOTAL, model, namespace)
    )
}

pub fn avg_output_tokens_query(model: &str, namespace: &str) -> String {
    ratio_of_rates(GENERATION_TOKENS_SUM, GENERATION_TOKENS_COUNT, model, namespace)
}

pub fn avg_input_tokens_query(model: &str, namespace: &str) -> String {
    ratio_of_rates(PROMPT_TOKENS_SUM, PROMPT_TOKENS_COUNT, model, namespace)
}

/// Seconds; scale by 1000 for ms.
pub fn ttft_query(model: &str, namespace: &str) -> String {
    ratio_of_rates(TTFT_SECONDS_SUM, TTFT_SECONDS_COUNT, model, namespace)
}

/// Seconds; scale by 1000 for ms.
pub fn itl_query(model: &str, namespace: &str) -> String {
    ratio_of_rates(TPOT_SECONDS_SUM, TPOT_SECONDS_COUNT, model, namespace)
}

pub fn total_requests_query(model: &str, namespace: &str, window: Duration) -> String {
    format!(
        "sum(increase({}[{}s]))",
        selector(REQUEST_SUCCESS_TOTAL, model, namespace),
        window.as_secs().max(60)
    )
}

/// First sample of a result, 0 when the vector is empty.
fn first_value(field: &str, samples: &[Sample]) -> f64 {
    samples
        .first()
        .map(|s| sanitize_field(field, s.value))
        .unwrap_or(0.0)
        .max(0.0)
}

/// Everything observed for one variant in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantMetrics {
    pub load: LoadObservation,
    /// ms
    pub itl_average: f64,
    /// ms
    pub ttft_average: f64,
    /// Requests over the retention window; `None` when the query failed.
    pub total_requests: Option<f64>,
}

/// Query the load of `va`'s model in the variant's namespace.
///
/// Arrival rate and token failures fail the collection. Latency averages
/// degrade to 0 and the request count to unknown, with a warning.
pub async fn collect_variant_metrics(
    source: &dyn MetricsSource,
    va: &VariantAutoscaling,
    retention: Duration,
) -> Result<VariantMetrics, SourceError> {
    let model = va.spec.model_id.as_str();
    let ns = va.namespace.as_str();

    let arrival = first_value("arrival_rate", &source.query(&arrival_rate_query(model, ns)).await?);
    let output = first_value(
        "avg_output_tokens",
        &source.query(&avg_output_tokens_query(model, ns)).await?,
    );
    let input = first_value(
        "avg_input_tokens",
        &source.query(&avg_input_tokens_query(model, ns)).await?,
    );
    let total_requests = match source.query(&total_requests_query(model, ns, retention)).await {
        Ok(samples) => Some(first_value("total_requests", &samples)),
        Err(e) => {
            tracing::warn!(
                model_id=%model, namespace=%ns, error=%e,
                "request count query failed, idle window unknown"
            );
            None
        }
    };

    let latency_ms = |field: &'static str, result: Result<Vec<Sample>, SourceError>| match result {
        Ok(samples) => sanitize_field(field, first_value(field, &samples) * 1000.0),
        Err(e) => {
            tracing::warn!(model_id=%model, namespace=%ns, field, error=%e, "latency query failed, using 0");
            0.0
        }
    };
    let ttft_average = latency_ms("ttft_average", source.query(&ttft_query(model, ns)).await);
    let itl_average = latency_ms("itl_average", source.query(&itl_query(model, ns)).await);

    Ok(VariantMetrics {
        load: LoadObservation::new(arrival, input, output),
        itl_average,
        ttft_average,
        total_requests,
    })
}

/// Current allocation of a variant as seen from its deployment.
/// `replica_cost` is the cost of one replica on the variant's accelerator.
pub fn current_allocation(va: &VariantAutoscaling, deployment: &DeploymentInfo, replica_cost: f64) -> Allocation {
    let replicas = deployment.current_replicas();
    Allocation {
        variant_id: va.spec.variant_id.clone(),
        accelerator: va.spec.accelerator.clone(),
        num_replicas: replicas,
        max_batch: va.spec.variant_profile.max_batch_size,
        variant_cost: format_decimal(f64::from(replicas) * replica_cost),
    }
}

/// Check connectivity with a trivial query, retrying on the Prometheus policy.
pub async fn validate(source: &dyn MetricsSource, backoff: Backoff) -> Result<(), SourceError> {
    retry(backoff, "prometheus validation", || source.query("up")).await?;
    tracing::info!("prometheus connectivity validated");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use varscale_common::{ConfigMapKeyRef, PerfParms, VariantAutoscalingSpec, VariantAutoscalingStatus, VariantProfile};

    use super::*;

    /// Answers queries by metric name; unmatched queries return an empty vector.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub values: Mutex<BTreeMap<&'static str, f64>>,
        pub failing: Mutex<Vec<&'static str>>,
        pub queries: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub fn with(values: &[(&'static str, f64)]) -> Self {
            let s = Self::default();
            s.values.lock().unwrap().extend(values.iter().copied());
            s
        }

        pub fn fail(&self, metric: &'static str) {
            self.failing.lock().unwrap().push(metric);
        }
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn query(&self, promql: &str) -> Result<Vec<Sample>, SourceError> {
            self.queries.lock().unwrap().push(promql.to_string());
            if self.failing.lock().unwrap().iter().any(|m| promql.contains(m)) {
                return Err(SourceError::Request("connection refused".to_string()));
            }
            let values = self.values.lock().unwrap();
            // Match the first metric name in the query.
            let hit = values
                .iter()
                .filter_map(|(metric, v)| promql.find(metric).map(|pos| (pos, *v)))
                .min_by_key(|(pos, _)| *pos);
            Ok(hit
                .map(|(_, value)| {
                    vec![Sample {
                        labels: BTreeMap::new(),
                        value,
                    }]
                })
                .unwrap_or_default())
        }
    }

    pub(crate) fn variant(name: &str, ns: &str, model: &str) -> VariantAutoscaling {
        let parms = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        VariantAutoscaling {
            name: name.to_string(),
            namespace: ns.to_string(),
            labels: BTreeMap::new(),
            spec: VariantAutoscalingSpec {
                model_id: model.to_string(),
                variant_id: format!("{model}-A100-1"),
                accelerator: "A100".to_string(),
                accelerator_count: 1,
                slo_class_ref: ConfigMapKeyRef {
                    name: "service-classes-config".to_string(),
                    key: "premium".to_string(),
                },
                variant_profile: VariantProfile {
                    perf_parms: PerfParms {
                        decode_parms: parms(&[("alpha", "10"), ("beta", "2")]),
                        prefill_parms: parms(&[("gamma", "5"), ("delta", "0")]),
                    },
                    max_batch_size: 4,
                },
                scale_to_zero: None,
                keep_accelerator: true,
            },
            status: VariantAutoscalingStatus::default(),
        }
    }

    #[test]
    fn test_queries() {
        assert_eq!(
            arrival_rate_query("llama", "prod"),
            r#"sum(rate(vllm:request_success_total{model_name="llama",namespace="prod"}[1m])) * 60"#
        );
        assert_eq!(
            avg_output_tokens_query("llama", "prod"),
            r#"sum(rate(vllm:request_generation_tokens_sum{model_name="llama",namespace="prod"}[1m]))/sum(rate(vllm:request_generation_tokens_count{model_name="llama",namespace="prod"}[1m]))"#
        );
        assert!(total_requests_query("llama", "prod", Duration::from_secs(600)).ends_with("[600s]))"));
    }

    #[test]
    fn test_parse_vector() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{"model_name":"llama"},"value":[1714560000.123,"42.5"]},
            {"metric":{},"value":[1714560000.123,"NaN"]}]}}"#;
        let samples = parse_response(body).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 42.5);
        assert_eq!(samples[0].labels["model_name"], "llama");
        assert!(samples[1].value.is_nan());
    }

    #[test]
    fn test_parse_empty_and_scalar() {
        let empty = br#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(parse_response(empty).unwrap().is_empty());

        let scalar = br#"{"status":"success","data":{"resultType":"scalar","result":[1714560000,"1"]}}"#;
        assert_eq!(parse_response(scalar).unwrap()[0].value, 1.0);
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_response(br#"{"status":"error","errorType":"bad_data","error":"parse error"}"#).unwrap_err();
        assert_eq!(
            err,
            SourceError::Query {
                error_type: "bad_data".to_string(),
                error: "parse error".to_string()
            }
        );
        assert!(!err.is_transient());
        assert!(matches!(parse_response(b"<html>"), Err(SourceError::Decode(_))));
    }

    #[test]
    fn test_error_classification() {
        assert!(SourceError::Request("timeout".into()).is_transient());
        assert!(SourceError::Status { status: 503, body: String::new() }.is_transient());
        assert!(SourceError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!SourceError::Status { status: 401, body: String::new() }.is_transient());
    }

    #[tokio::test]
    async fn test_collect_metrics() {
        let source = FakeSource::with(&[
            (REQUEST_SUCCESS_TOTAL, 120.0),
            (GENERATION_TOKENS_SUM, 128.0),
            (PROMPT_TOKENS_SUM, 512.0),
            (TTFT_SECONDS_SUM, 0.25),
            (TPOT_SECONDS_SUM, 0.02),
        ]);
        let m = collect_variant_metrics(&source, &variant("a", "prod", "llama"), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(m.load, LoadObservation::new(120.0, 512.0, 128.0));
        assert_eq!(m.ttft_average, 250.0);
        assert_eq!(m.itl_average, 20.0);
        // The increase() query also hits the success counter.
        assert_eq!(m.total_requests, Some(120.0));
    }

    #[tokio::test]
    async fn test_empty_vectors_read_as_zero() {
        let source = FakeSource::default();
        let m = collect_variant_metrics(&source, &variant("a", "prod", "llama"), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(m.load, LoadObservation::default());
        assert_eq!(m.total_requests, Some(0.0));
        assert_eq!(format_decimal(m.load.arrival_rate), "0.00");
    }

    #[tokio::test]
    async fn test_non_finite_values_fixed() {
        let source = FakeSource::with(&[(REQUEST_SUCCESS_TOTAL, f64::INFINITY), (GENERATION_TOKENS_SUM, f64::NAN)]);
        let m = collect_variant_metrics(&source, &variant("a", "prod", "llama"), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(m.load.arrival_rate, 0.0);
        assert_eq!(m.load.avg_output_tokens, 0.0);
    }

    #[tokio::test]
    async fn test_arrival_failure_fails_collection() {
        let source = FakeSource::default();
        source.fail(REQUEST_SUCCESS_TOTAL);
        let res = collect_variant_metrics(&source, &variant("a", "prod", "llama"), Duration::from_secs(600)).await;
        assert!(matches!(res, Err(SourceError::Request(_))));
    }

    #[tokio::test]
    async fn test_latency_failure_degrades_to_zero() {
        let source = FakeSource::with(&[(REQUEST_SUCCESS_TOTAL, 60.0), (TTFT_SECONDS_SUM, 0.5)]);
        source.fail(TPOT_SECONDS_SUM);
        let m = collect_variant_metrics(&source, &variant("a", "prod", "llama"), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(m.itl_average, 0.0);
        assert_eq!(m.ttft_average, 500.0);
    }

    #[tokio::test]
    async fn test_request_count_failure_degrades_to_unknown() {
        let source = FakeSource::with(&[(REQUEST_SUCCESS_TOTAL, 60.0), (GENERATION_TOKENS_SUM, 100.0)]);
        source.fail("increase(");
        let m = collect_variant_metrics(&source, &variant("a", "prod", "llama"), Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(m.load.arrival_rate, 60.0);
        assert_eq!(m.load.avg_output_tokens, 100.0);
        assert_eq!(m.total_requests, None);
    }

    #[test]
    fn test_current_allocation() {
        let dep = DeploymentInfo {
            name: "a".to_string(),
            namespace: "prod".to_string(),
            replicas: 3,
            status_replicas: Some(2),
        };
        let alloc = current_allocation(&variant("a", "prod", "llama"), &dep, 40.0);
        assert_eq!(alloc.num_replicas, 2);
        assert_eq!(alloc.variant_cost, "80.00");
        assert_eq!(alloc.max_batch, 4);
        assert_eq!(alloc.accelerator, "A100");
    }

    #[tokio::test]
    async fn test_validate() {
        let fast = Backoff {
            duration: Duration::from_millis(1),
            factor: 2.0,
            jitter: 0.0,
            steps: 3,
        };
        assert!(validate(&FakeSource::default(), fast).await.is_ok());

        let down = FakeSource::default();
        down.fail("up");
        assert!(validate(&down, fast).await.is_err());
        assert_eq!(down.queries.lock().unwrap().len(), 3);
    }
}
