// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! Connection, consumer and lifecycle settings. Values are layered from the
//! built-in defaults, an optional configuration file and `MQ_`-prefixed
//! environment variables (nested keys use `__`, e.g. `MQ_RABBITMQ__HOST`).

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default location of the optional configuration file, without extension.
pub const DEFAULT_CONFIG_FILE: &str = "config/rabbitmq";
/// Prefix of the environment variables read by [`Configs::load`].
pub const ENV_PREFIX: &str = "MQ";

/// Application-level settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfigs {
    /// Reported to the broker as the connection name.
    pub name: String,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
    /// Number of lifecycle events retained for [`crate::events::EventBus::history`].
    pub event_history: usize,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "rabbitmq-reliable".to_owned(),
            event_capacity: 1024,
            event_history: 4096,
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Upper bound for publish and topology declaration calls.
    pub operation_timeout_ms: u64,
    /// Upper bound for flushing outstanding acks/nacks on close.
    pub drain_timeout_ms: u64,
    /// Per-channel prefetch applied before consuming.
    pub prefetch: u16,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            operation_timeout_ms: 5_000,
            drain_timeout_ms: 10_000,
            prefetch: 32,
        }
    }
}

impl RabbitMQConfigs {
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Process-wide consumer defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerConfigs {
    /// Retry budget used when neither the message nor the registration overrides it.
    pub max_retries: u32,
    pub requeue_on_failure: bool,
    /// Maximum number of messages a single subscription handles at once.
    pub concurrency: usize,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        ConsumerConfigs {
            max_retries: 3,
            requeue_on_failure: true,
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub consumer: ConsumerConfigs,
}

impl Configs {
    /// Loads `.env`, then [`DEFAULT_CONFIG_FILE`] if present, then the environment.
    pub fn load() -> Result<Configs, AmqpError> {
        if dotenvy::dotenv().is_ok() {
            debug!("loaded .env file");
        }

        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Same as [`Configs::load`] with an explicit configuration file and no `.env`.
    pub fn load_from(file: &str) -> Result<Configs, AmqpError> {
        let cfg = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let configs: Configs = cfg.try_deserialize()?;
        debug!(
            host = configs.rabbitmq.host.as_str(),
            port = configs.rabbitmq.port,
            "configs loaded"
        );

        Ok(configs)
    }
}
