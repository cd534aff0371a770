use std::time::Duration;

use varscale_common::ConfigMap;

use crate::args::Args;

pub const KEY_SCALE_TO_ZERO: &str = "scale_to_zero_enabled";
pub const KEY_LOG_LEVEL: &str = "log_level";

/// Environment-level fallbacks, used only where a variant does not carry
/// its own setting. Passed explicitly into the adapter each cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDefaults {
    pub scale_to_zero_enabled: bool,
    pub log_level: String,
}

impl ControllerDefaults {
    /// Overlay the defaults configmap. Unparseable values keep the current setting.
    pub fn with_config_map(&self, cm: &ConfigMap) -> Self {
        let mut out = self.clone();
        if let Some(raw) = cm.data.get(KEY_SCALE_TO_ZERO) {
            match parse_bool(raw) {
                Some(v) => out.scale_to_zero_enabled = v,
                None => tracing::warn!(
                    configmap=%cm.name,
                    key=KEY_SCALE_TO_ZERO,
                    value=%raw,
                    "ignoring non-boolean value"
                ),
            }
        }
        if let Some(level) = cm.data.get(KEY_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
            out.log_level = level.trim().to_ascii_lowercase();
        }
        out
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub config_namespace: String,
    pub accelerator_config_map: String,
    pub service_class_config_map: String,
    pub defaults_config_map: String,
    pub reconcile_interval: Duration,
    pub metrics_retention: Duration,
    pub search_ceiling: u32,
    pub defaults: ControllerDefaults,
}

impl ControllerConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            config_namespace: args.config_namespace.clone(),
            accelerator_config_map: args.accelerator_config_map.clone(),
            service_class_config_map: args.service_class_config_map.clone(),
            defaults_config_map: args.defaults_config_map.clone(),
            reconcile_interval: Duration::from_secs(args.reconcile_interval_secs.max(1)),
            metrics_retention: Duration::from_secs(args.metrics_retention_secs.max(60)),
            search_ceiling: args.search_ceiling.max(1),
            defaults: ControllerDefaults {
                scale_to_zero_enabled: args.scale_to_zero,
                log_level: args.log_level.clone(),
            },
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            config_namespace: "varscale-system".to_string(),
            accelerator_config_map: "accelerator-unit-costs".to_string(),
            service_class_config_map: "service-classes-config".to_string(),
            defaults_config_map: "varscale-config".to_string(),
            reconcile_interval: Duration::from_secs(60),
            metrics_retention: Duration::from_secs(600),
            search_ceiling: varscale_core::DEFAULT_SEARCH_CEILING,
            defaults: ControllerDefaults {
                scale_to_zero_enabled: false,
                log_level: "info".to_string(),
            },
        }
    }
}
