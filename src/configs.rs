// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Layered configuration: built-in defaults, then an optional file, then
//! environment variables using `__` as the section separator
//! (`RABBITMQ__HOST`, `APP__NAME`, ...).

use config::{Config, ConfigError, Environment, File};
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::path::Path;

/// File looked up by `load_configs`, without extension
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

/// Process-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    /// Announced to the broker as the connection name.
    pub name: String,
    /// Default tracing level when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "typed-rabbitmq".to_owned(),
            log_level: "info".to_owned(),
        }
    }
}

/// Broker connection and subscription settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Exchange every declared queue dead-letters to.
    pub dead_letter_exchange: String,
    pub prefetch: u16,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            dead_letter_exchange: "peril_dlx".to_owned(),
            prefetch: 10,
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these settings.
    ///
    /// The URI is assembled field by field, so credentials and vhost names
    /// containing reserved characters (`#`, `/`, `?`, `:`, `@`) are passed to
    /// the broker verbatim.
    ///
    /// # Returns
    /// An `AMQPUri` ready for `Connection::connect_uri`. An empty vhost or `/`
    /// selects the default vhost `/`; otherwise one leading `/` is dropped, so
    /// `/peril` and `peril` name the same vhost.
    pub fn amqp_uri(&self) -> AMQPUri {
        let vhost = match self.vhost.as_str() {
            "/" | "" => "/",
            other => other.strip_prefix('/').unwrap_or(other),
        };

        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: vhost.to_owned(),
            ..Default::default()
        }
    }
}

/// Loads configuration from `config/default.*` (if present) and the environment.
pub fn load_configs() -> Result<Configs, ConfigError> {
    build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
}

/// Loads configuration from an explicit file and the environment.
pub fn load_configs_from(path: &Path) -> Result<Configs, ConfigError> {
    build(File::from(path).required(true))
}

fn build<S>(file: S) -> Result<Configs, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    Config::builder()
        .add_source(file)
        .add_source(Environment::default().separator("__"))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_point_at_local_broker() {
        let cfg = Configs::default();
        let uri = cfg.rabbitmq.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.authority.userinfo.password, "guest");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert_eq!(cfg.rabbitmq.dead_letter_exchange, "peril_dlx");
        assert_eq!(cfg.rabbitmq.prefetch, 10);
    }

    #[test]
    fn named_vhost_drops_leading_slash() {
        let cfg = RabbitMQConfigs {
            vhost: "/peril".to_owned(),
            ..Default::default()
        };
        assert_eq!(cfg.amqp_uri().vhost, "peril");
    }

    #[test]
    fn reserved_characters_survive_in_credentials_and_vhost() {
        let cfg = RabbitMQConfigs {
            user: "game:admin".to_owned(),
            password: "p#ss/word?@x".to_owned(),
            vhost: "peril/eu".to_owned(),
            ..Default::default()
        };

        let uri = cfg.amqp_uri();
        assert_eq!(uri.authority.userinfo.username, "game:admin");
        assert_eq!(uri.authority.userinfo.password, "p#ss/word?@x");
        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "peril/eu");
    }

    #[test]
    #[serial]
    fn file_overrides_defaults() {
        let tmp = TempDir::new().expect("create tempdir");
        let path = tmp.path().join("broker.toml");
        fs::write(
            &path,
            r#"
                [app]
                name = "peril-server"

                [rabbitmq]
                host = "rabbit"
                dead_letter_exchange = "game_dlx"
            "#,
        )
        .expect("write config file");

        let cfg = load_configs_from(&path).expect("load configs");
        assert_eq!(cfg.app.name, "peril-server");
        assert_eq!(cfg.app.log_level, "info");
        assert_eq!(cfg.rabbitmq.host, "rabbit");
        assert_eq!(cfg.rabbitmq.port, 5672);
        assert_eq!(cfg.rabbitmq.dead_letter_exchange, "game_dlx");
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let tmp = TempDir::new().expect("create tempdir");
        let path = tmp.path().join("broker.toml");
        fs::write(&path, "[rabbitmq]\nhost = \"rabbit\"\nport = 5673\n").expect("write config file");

        temp_env::with_vars(
            [
                ("RABBITMQ__HOST", Some("10.0.0.7")),
                ("RABBITMQ__PREFETCH", Some("50")),
            ],
            || {
                let cfg = load_configs_from(&path).expect("load configs");
                assert_eq!(cfg.rabbitmq.host, "10.0.0.7");
                assert_eq!(cfg.rabbitmq.port, 5673);
                assert_eq!(cfg.rabbitmq.prefetch, 50);
            },
        );
    }

    #[test]
    #[serial]
    fn missing_default_file_falls_back_to_defaults() {
        temp_env::with_vars_unset(["RABBITMQ__HOST", "RABBITMQ__PREFETCH"], || {
            let cfg = load_configs().expect("load configs");
            assert_eq!(cfg.rabbitmq.host, "localhost");
        });
    }
}
