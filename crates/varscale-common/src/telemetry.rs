use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::{Arc, Mutex};

use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Map a configured verbosity onto a filter directive.
/// Unknown values fall back to `info`.
pub fn level_directive(log_level: &str) -> &'static str {
    match log_level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Handle on the active level filter, for changing verbosity at runtime.
/// A filter pinned through `RUST_LOG` is never replaced.
#[derive(Clone)]
pub struct LogLevel {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
    pinned: bool,
    active: Arc<Mutex<&'static str>>,
}

impl LogLevel {
    fn attached(handle: reload::Handle<EnvFilter, Registry>, directive: &'static str, pinned: bool) -> Self {
        Self {
            handle: Some(handle),
            pinned,
            active: Arc::new(Mutex::new(directive)),
        }
    }

    /// Not bound to a subscriber; only tracks the requested level.
    pub fn detached(log_level: &str) -> Self {
        Self {
            handle: None,
            pinned: false,
            active: Arc::new(Mutex::new(level_directive(log_level))),
        }
    }

    pub fn current(&self) -> &'static str {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch to `log_level`. Returns whether the active level changed.
    pub fn set(&self, log_level: &str) -> bool {
        if self.pinned {
            return false;
        }
        let directive = level_directive(log_level);
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if *active == directive {
            return false;
        }
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.reload(EnvFilter::new(directive)) {
                tracing::warn!(level = directive, error = %e, "failed to change log level");
                return false;
            }
        }
        *active = directive;
        true
    }
}

/// Initialize tracing with optional OTLP span export.
///
/// `RUST_LOG` wins over `log_level` when set. When `otlp_endpoint` is given,
/// spans are exported over OTLP/HTTP (the exporter appends `/v1/traces`).
///
/// Returns the tracer provider, which the caller should keep alive and
/// shut down before exit, and the handle for later level changes.
pub fn init_tracing(
    service_name: &str,
    log_level: &str,
    otlp_endpoint: Option<&str>,
    otlp_token: Option<&str>,
) -> (Option<TracerProvider>, LogLevel) {
    let directive = level_directive(log_level);
    let (env_filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, true),
        Err(_) => (EnvFilter::new(directive), false),
    };
    let (env_filter, handle) = reload::Layer::new(env_filter);
    let level = LogLevel::attached(handle, directive, pinned);

    let fmt_layer = tracing_subscriber::fmt::layer();

    let Some(endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return (None, level);
    };

    let mut headers = std::collections::HashMap::new();
    if let Some(token) = otlp_token.filter(|t| !t.is_empty()) {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(headers)
        .build()
    {
        Ok(e) => e,
        Err(err) => {
            eprintln!("failed to create OTLP exporter: {err}, falling back to stdout only");
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            return (None, level);
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    tracing::info!(endpoint, service_name, "OTLP tracing enabled");
    (Some(provider), level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive(" warn "), "warn");
        assert_eq!(level_directive("error"), "error");
        assert_eq!(level_directive("verbose"), "info");
        assert_eq!(level_directive(""), "info");
    }

    #[test]
    fn test_reload_changes_active_filter() {
        let (layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let level = LogLevel::attached(handle.clone(), "info", false);

        assert!(!level.set("INFO"));
        assert!(level.set("debug"));
        assert_eq!(level.current(), "debug");
        assert_eq!(handle.with_current(|f| f.to_string()).unwrap(), "debug");

        // Unknown values fall back to info.
        assert!(level.set("verbose"));
        assert_eq!(handle.with_current(|f| f.to_string()).unwrap(), "info");
    }

    #[test]
    fn test_pinned_filter_is_kept() {
        let (layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("warn"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let level = LogLevel::attached(handle.clone(), "info", true);

        assert!(!level.set("debug"));
        assert_eq!(level.current(), "info");
        assert_eq!(handle.with_current(|f| f.to_string()).unwrap(), "warn");
    }

    #[test]
    fn test_detached_tracks_level() {
        let level = LogLevel::detached("warn");
        assert_eq!(level.current(), "warn");
        assert!(level.set("error"));
        assert_eq!(level.clone().current(), "error");
    }
}
