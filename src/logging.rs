// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Process-wide log subscriber.
//!
//! `RUST_LOG` wins over the configured level when it is set.

use crate::{configs::AppConfigs, errors::AmqpError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global `tracing` subscriber.
///
/// Fails when the level directive is invalid or a subscriber is already set.
pub fn init_logging(app: &AppConfigs) -> Result<(), AmqpError> {
    let env_filter = env_filter(&app.log_level)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(true),
        )
        .try_init()
        .map_err(|_| AmqpError::InternalError)
}

fn env_filter(level: &str) -> Result<EnvFilter, AmqpError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|_| AmqpError::InternalError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn falls_back_to_configured_level() {
        temp_env::with_var_unset("RUST_LOG", || {
            let filter = env_filter("debug").unwrap();
            assert_eq!(filter.to_string(), "debug");
        });
    }

    #[test]
    #[serial]
    fn rust_log_overrides_configured_level() {
        temp_env::with_var("RUST_LOG", Some("typed_rabbitmq=trace"), || {
            let filter = env_filter("info").unwrap();
            assert_eq!(filter.to_string(), "typed_rabbitmq=trace");
        });
    }

    #[test]
    #[serial]
    fn second_install_is_rejected() {
        let app = AppConfigs::default();
        let _ = init_logging(&app);
        assert_eq!(init_logging(&app), Err(AmqpError::InternalError));
    }
}
