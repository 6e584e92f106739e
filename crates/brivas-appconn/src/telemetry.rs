//! Tracing setup for binaries embedding the stack

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Level for the connection stack and the peer binary
    pub log_level: String,
    /// One JSON object per event, carrying the current span's fields
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// `APPCONN_LOG_LEVEL` and `APPCONN_JSON_LOGS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_level: std::env::var("APPCONN_LOG_LEVEL").unwrap_or(defaults.log_level),
            json_logs: std::env::var("APPCONN_JSON_LOGS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.json_logs),
        }
    }

    /// Filter used when `RUST_LOG` is unset; dependencies only report warnings
    pub fn directives(&self) -> String {
        format!(
            "warn,brivas_appconn={level},appconn_peer={level}",
            level = self.log_level
        )
    }
}

/// Install a global subscriber; fails if one is already set
pub fn init_tracing(service_name: &str, config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    // connection spans carry remote_id and index
    let json = config.json_logs.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let plain = (!config.json_logs).then(|| fmt::layer().compact());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    tracing::info!(
        service = service_name,
        log_level = %config.log_level,
        json_logs = config.json_logs,
        "Tracing initialized"
    );
    Ok(())
}
