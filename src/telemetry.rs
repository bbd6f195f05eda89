// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging And Propagation Setup
//!
//! Installs the global `tracing` subscriber and the W3C trace-context
//! propagator used to carry traces across the broker.

use crate::{config::LogConfig, errors::AmqpError};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber and propagator.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already set.
pub fn init_logging(cfg: &LogConfig) -> Result<(), AmqpError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .map_err(|err| AmqpError::ConfigError(format!("log level: {err}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if cfg.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    installed.map_err(|err| AmqpError::ConfigError(format!("logging: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_is_a_config_error() {
        std::env::remove_var("RUST_LOG");
        let cfg = LogConfig {
            level: "eventbus=loud".to_owned(),
            json: false,
        };

        assert!(matches!(init_logging(&cfg), Err(AmqpError::ConfigError(_))));
    }
}
