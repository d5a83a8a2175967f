//! Tracing subscriber wiring for hosts embedding the cores.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// 0 = errors only, 1 = info, 2+ = debug.
    pub verbosity: u8,
    pub format: LogFormat,
    /// Extra filter directive, combined with the `LOG` env var.
    pub filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            format: LogFormat::Compact,
            filter: None,
        }
    }
}

/// Install a global subscriber for the configured verbosity and format.
///
/// Returns `false` when a subscriber is already installed (tests install
/// their own), in which case the call is a no-op.
pub fn init(config: &TelemetryConfig) -> bool {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();
    if let Some(directive) = &config.filter
        && let Ok(parsed) = directive.parse()
    {
        filter = filter.add_directive(parsed);
    }

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    };

    Registry::default()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .is_ok()
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_with_defaults() {
        let config: TelemetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.verbosity, 1);
        assert!(matches!(config.format, LogFormat::Compact));
    }
}
