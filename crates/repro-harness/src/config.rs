//! Environment-backed run configuration and tunable run settings.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use hub_contract::{
    ConnectionString, ServicePrincipal, StartPosition, SubscribeOptions, TopicLocator,
    TopicOptions,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variables a run requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HarnessEnv {
    TenantId,
    ResourceGroup,
    SubscriptionId,
    ClientId,
    ClientSecret,
    Namespace,
    TopicName,
    ConnectionString,
}

impl HarnessEnv {
    pub const ALL: [Self; 8] = [
        Self::TenantId,
        Self::ResourceGroup,
        Self::SubscriptionId,
        Self::ClientId,
        Self::ClientSecret,
        Self::Namespace,
        Self::TopicName,
        Self::ConnectionString,
    ];

    /// Canonical variable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TenantId => "AZURE_TENANT_ID",
            Self::ResourceGroup => "AZURE_RESOURCE_GROUP",
            Self::SubscriptionId => "AZURE_SUBSCRIPTION_ID",
            Self::ClientId => "AZURE_CLIENT_ID",
            Self::ClientSecret => "AZURE_CLIENT_SECRET",
            Self::Namespace => "EVENTHUB_NAMESPACE",
            Self::TopicName => "EVENTHUB_NAME",
            Self::ConnectionString => "EVENTHUB_CONNECTION_STRING",
        }
    }
}

/// Identity, topic address, and connection details for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub principal: ServicePrincipal,
    pub topic: TopicLocator,
    pub connection: ConnectionString,
}

impl HarnessConfig {
    /// Load from the process environment. Non UTF-8 values are rejected by name.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|name| match std::env::var_os(name) {
            None => Ok(None),
            Some(raw) => raw.into_string().map(Some).map_err(|_| ConfigError::Invalid {
                name,
                reason: "must be valid UTF-8".into(),
            }),
        })
    }

    /// Load through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_source(|name| Ok(lookup(name)))
    }

    fn from_source<F>(source: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Result<Option<String>, ConfigError>,
    {
        let mut values = HashMap::new();
        let mut missing = Vec::new();
        for var in HarnessEnv::ALL {
            match source(var.as_str())? {
                Some(value) if !value.trim().is_empty() => {
                    values.insert(var, value);
                }
                _ => missing.push(var.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing { names: missing });
        }
        let mut take = |var: HarnessEnv| values.remove(&var).unwrap_or_default();

        let raw_connection = take(HarnessEnv::ConnectionString);
        let connection =
            ConnectionString::parse(&raw_connection).map_err(|err| ConfigError::Invalid {
                name: HarnessEnv::ConnectionString.as_str(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            principal: ServicePrincipal {
                tenant_id: take(HarnessEnv::TenantId),
                client_id: take(HarnessEnv::ClientId),
                client_secret: take(HarnessEnv::ClientSecret),
            },
            topic: TopicLocator {
                subscription_id: take(HarnessEnv::SubscriptionId),
                resource_group: take(HarnessEnv::ResourceGroup),
                namespace: take(HarnessEnv::Namespace),
                topic: take(HarnessEnv::TopicName),
            },
            connection,
        })
    }
}

/// Tunables for a run; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Upper bound on waiting for the expected deliveries.
    pub settle_timeout_ms: u64,
    /// Extra observation window after completion, to catch late duplicates.
    pub linger_ms: u64,
    pub consumer_group: String,
    pub expected_events: usize,
    pub partition_count: u32,
    pub retention_days: u32,
    /// Interval after which the consumer delivers an empty batch.
    pub max_wait_ms: u64,
    /// Upper bound on each individual teardown release.
    pub teardown_timeout_ms: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            settle_timeout_ms: 30_000,
            linger_ms: 500,
            consumer_group: "$Default".into(),
            expected_events: 1,
            partition_count: 1,
            retention_days: 1,
            max_wait_ms: 1_000,
            teardown_timeout_ms: 30_000,
        }
    }
}

impl RunSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(raw).map_err(|err| ConfigError::Settings(err.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            ConfigError::Settings(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expected_events != 1 {
            return Err(ConfigError::Settings(format!(
                "expected_events must be 1 for a single-send run, got {}",
                self.expected_events
            )));
        }
        if self.settle_timeout_ms == 0 {
            return Err(ConfigError::Settings(
                "settle_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.max_wait_ms == 0 {
            return Err(ConfigError::Settings(
                "max_wait_ms must be greater than zero".into(),
            ));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(ConfigError::Settings(
                "teardown_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.partition_count == 0 {
            return Err(ConfigError::Settings(
                "partition_count must be at least 1".into(),
            ));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ConfigError::Settings("consumer_group must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    #[must_use]
    pub const fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    #[must_use]
    pub const fn topic_options(&self) -> TopicOptions {
        TopicOptions {
            partition_count: self.partition_count,
            retention_days: self.retention_days,
        }
    }

    /// Subscription from the latest position, so only this run's event is seen.
    #[must_use]
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            start_position: StartPosition::Latest,
            max_wait_time: Duration::from_millis(self.max_wait_ms),
            ..SubscribeOptions::default()
        }
    }
}
