//! Tracing bootstrap.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and a `fmt` layer.
//! `RUST_LOG`, when set, overrides the configured level.

use pos_resilience_core::config::ObservabilitySettings;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber at `level` (`trace` .. `error`, or any filter directive).
///
/// Returns `false` if a global subscriber was already installed; the existing one is
/// left in place.
pub fn init_tracing(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(level = %level, "Tracing initialized");
    }
    installed
}

/// [`init_tracing`] at the configured log level.
pub fn init_from_settings(settings: &ObservabilitySettings) -> bool {
    init_tracing(&settings.log_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_a_no_op() {
        let _ = init_tracing("debug");
        assert!(!init_tracing("info"));
    }
}
