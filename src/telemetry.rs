use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::BridgeError;

/// Installs the global subscriber. `RUST_LOG` takes precedence over the configured level;
/// format `json` switches stdout to structured lines.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<(), BridgeError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let layer = if cfg.format.eq_ignore_ascii_case("json") {
        fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer().with_target(false).with_filter(filter).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| BridgeError::Config(format!("tracing init failed: {}", e)))
}
