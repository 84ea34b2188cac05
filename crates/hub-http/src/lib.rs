//! HTTP client for the REST-reachable step of a reproduction run: topic
//! lifecycle on the resource management plane. Bearer credentials come from
//! whichever [`hub_contract::IdentityProvider`] the run is configured with.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hub_contract::{Credential, HubError, ManagementStatus, TopicAdmin, TopicLocator, TopicOptions};
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use url::{Host, Url};

/// Endpoint and limits of the management client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpClientConfig {
    /// Management plane base URL; also the token audience.
    pub management_endpoint: String,
    /// `api-version` query parameter sent to the management plane.
    pub api_version: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            management_endpoint: "https://management.azure.com".into(),
            api_version: "2021-11-01".into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must use https unless it targets a loopback host: {value}")]
    InsecureUrl { field: &'static str, value: String },
    #[error("{field} is not a valid URL: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("failed to build http client: {0}")]
    Client(String),
}

impl HttpClientConfig {
    /// Require https for anything but loopback hosts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("management_endpoint", &self.management_endpoint)?;
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "api_version",
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    fn build_client(&self) -> Result<Client, ConfigError> {
        self.validate()?;
        Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|err| ConfigError::Client(err.to_string()))
    }

    /// Scope a credential must be issued for to call the management plane.
    #[must_use]
    pub fn token_scope(&self) -> String {
        format!("{}/.default", self.management_endpoint.trim_end_matches('/'))
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { field });
    }
    let url = Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        field,
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "https" => Ok(()),
        "http" if url.host().is_some_and(|host| is_loopback(&host)) => Ok(()),
        _ => Err(ConfigError::InsecureUrl {
            field,
            value: value.to_string(),
        }),
    }
}

fn is_loopback(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            domain.eq_ignore_ascii_case("localhost")
                || domain.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
        }
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
    }
}

/// Topic create-or-update and delete on the resource management plane.
#[derive(Debug, Clone)]
pub struct ArmTopicAdmin {
    config: HttpClientConfig,
    client: Client,
}

impl ArmTopicAdmin {
    pub fn new(config: HttpClientConfig) -> Result<Self, ConfigError> {
        let client = config.build_client()?;
        Ok(Self { config, client })
    }

    /// Resource URL of `topic`, including the `api-version` query.
    #[must_use]
    pub fn topic_url(&self, topic: &TopicLocator) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.EventHub/namespaces/{}/eventhubs/{}?api-version={}",
            self.config.management_endpoint.trim_end_matches('/'),
            topic.subscription_id,
            topic.resource_group,
            topic.namespace,
            topic.topic,
            self.config.api_version
        )
    }
}

fn status_of(response: &reqwest::Response) -> ManagementStatus {
    ManagementStatus(response.status().as_u16())
}

#[async_trait]
impl TopicAdmin for ArmTopicAdmin {
    async fn create_or_update_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
        options: &TopicOptions,
    ) -> Result<ManagementStatus, HubError> {
        let body = json!({
            "properties": {
                "partitionCount": options.partition_count,
                "messageRetentionInDays": options.retention_days,
            }
        });
        let response = self
            .client
            .put(self.topic_url(topic))
            .bearer_auth(&credential.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| HubError::transport(format!("create-or-update {topic} failed: {err}")))?;
        let status = status_of(&response);
        info!(%topic, %status, "create-or-update topic");
        Ok(status)
    }

    async fn delete_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
    ) -> Result<ManagementStatus, HubError> {
        let response = self
            .client
            .delete(self.topic_url(topic))
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|err| HubError::transport(format!("delete {topic} failed: {err}")))?;
        let status = status_of(&response);
        info!(%topic, %status, "delete topic");
        Ok(status)
    }
}
