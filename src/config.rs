// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Consumer and publisher settings of an application, loadable in layers:
//! 1. `mercury.yaml` in the working directory, if present
//! 2. An explicit file path
//! 3. The file named by `MERCURY_CONFIG`
//! 4. Environment variables prefixed with `MERCURY`, nested with `__`
//!    (e.g. `MERCURY__CONSUMER__QUEUE_NAMES_PREFIX=prod-billing`)

use crate::{errors::MercuryError, queue::SubscriptionConfig, subscription::SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "mercury";
/// Environment variable naming an additional configuration file
pub const CONFIG_ENV_VAR: &str = "MERCURY_CONFIG";
/// Prefix of configuration environment variables
pub const CONFIG_ENV_PREFIX: &str = "MERCURY";

/// Sizing of the shared consumption executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum concurrently running jobs; unset means an elastic pool.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub queue_names_prefix: String,
    pub subscriptions: Vec<SubscriptionConfig>,
    pub executor: ExecutorConfig,
}

impl ConsumerConfig {
    pub fn new(queue_names_prefix: &str) -> ConsumerConfig {
        ConsumerConfig {
            queue_names_prefix: queue_names_prefix.to_owned(),
            ..ConsumerConfig::default()
        }
    }

    pub fn subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.executor.max_concurrency = Some(max);
        self
    }

    /// Rejects duplicate subscription ids and invalid queue settings.
    pub fn validate(&self) -> Result<(), MercuryError> {
        let mut seen: HashSet<&SubscriptionId> = HashSet::new();
        for subscription in &self.subscriptions {
            if !seen.insert(subscription.id()) {
                return Err(MercuryError::DuplicateSubscription(subscription.id().to_string()));
            }
            subscription.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub topic_names_prefix: String,
    /// Topics whose publishers are created eagerly by `prepare()`
    pub topics_for_publishing: Vec<String>,
}

impl PublisherConfig {
    pub fn new(topic_names_prefix: &str) -> PublisherConfig {
        PublisherConfig {
            topic_names_prefix: topic_names_prefix.to_owned(),
            topics_for_publishing: Vec::new(),
        }
    }

    pub fn topic(mut self, topic: &str) -> Self {
        self.topics_for_publishing.push(topic.to_owned());
        self
    }
}

/// Connection settings of the managed backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Region of the backend; the provider chain decides when unset.
    pub region: Option<String>,
    /// Endpoint override, e.g. a local emulator.
    pub endpoint_url: Option<String>,
}

/// Root configuration of an application using mercury.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MercuryConfig {
    /// Identifier stamped as `senderAppId` on published envelopes
    pub app_id: String,
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    pub backend: BackendConfig,
}

impl MercuryConfig {
    pub fn load(path: Option<&str>) -> Result<MercuryConfig, MercuryError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let cfg: MercuryConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|err| MercuryError::ConfigLoadError(err.to_string()))?;

        cfg.consumer.validate()?;
        Ok(cfg)
    }
}
