//! Event hub client contract shared by the reproduction harness and its backends.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod memory;

pub use memory::{CloseTarget, DeliveryFault, HubCall, InMemoryHub};

/// Default byte budget of an outbound batch.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1_048_576;

/// Errors surfaced by any client of the event hub surface.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubError {
    /// The identity provider or service rejected the caller.
    #[error("unauthorized: {detail}")]
    Unauthorized { detail: String },
    /// The addressed topic, partition, or resource does not exist.
    #[error("not found: {detail}")]
    NotFound { detail: String },
    /// The request was malformed or violated a client-side limit.
    #[error("invalid request: {detail}")]
    InvalidRequest { detail: String },
    /// Network or protocol failure talking to the service.
    #[error("transport error: {detail}")]
    Transport { detail: String },
    /// The client or subscription was already closed.
    #[error("closed: {detail}")]
    Closed { detail: String },
    /// A condition the scenario does not expect to happen.
    #[error("unexpected condition: {detail}")]
    Unexpected { detail: String },
    /// Any other failure.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl HubError {
    pub fn unexpected(detail: impl Into<String>) -> Self {
        Self::Unexpected {
            detail: detail.into(),
        }
    }

    pub fn closed(detail: impl Into<String>) -> Self {
        Self::Closed {
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            detail: detail.into(),
        }
    }
}

/// Non-interactive identity used to obtain a credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ServicePrincipal {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Bearer credential issued by an [`IdentityProvider`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: SystemTime,
    pub tenant_id: String,
}

impl Credential {
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Fully qualified address of a topic on the management plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicLocator {
    pub subscription_id: String,
    pub resource_group: String,
    pub namespace: String,
    pub topic: String,
}

impl fmt::Display for TopicLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_group, self.namespace, self.topic)
    }
}

/// Properties applied when a topic is created or updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicOptions {
    pub partition_count: u32,
    pub retention_days: u32,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            partition_count: 1,
            retention_days: 1,
        }
    }
}

/// Status code returned by a management call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementStatus(pub u16);

impl ManagementStatus {
    pub const OK: Self = Self(200);
    pub const CREATED: Self = Self(201);
    pub const NOT_FOUND: Self = Self(404);

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }
}

impl fmt::Display for ManagementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed shared-access connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: String,
    pub key_name: String,
    pub key: String,
    pub entity_path: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error("segment '{0}' is not a key=value pair")]
    MalformedSegment(String),
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("endpoint must use the sb:// scheme, got '{0}'")]
    InvalidEndpoint(String),
}

impl ConnectionString {
    /// Parse `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...[;EntityPath=...]`.
    pub fn parse(raw: &str) -> Result<Self, ConnectionStringError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;
        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Keys may contain '=' padding, so only split on the first one.
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::MalformedSegment(segment.to_string()))?;
            let value = value.trim().to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                "entitypath" => entity_path = Some(value),
                _ => {}
            }
        }
        let endpoint = endpoint
            .filter(|v| !v.is_empty())
            .ok_or(ConnectionStringError::MissingKey("Endpoint"))?;
        if !endpoint.starts_with("sb://") {
            return Err(ConnectionStringError::InvalidEndpoint(endpoint));
        }
        Ok(Self {
            endpoint,
            key_name: key_name
                .filter(|v| !v.is_empty())
                .ok_or(ConnectionStringError::MissingKey("SharedAccessKeyName"))?,
            key: key
                .filter(|v| !v.is_empty())
                .ok_or(ConnectionStringError::MissingKey("SharedAccessKey"))?,
            entity_path: entity_path.filter(|v| !v.is_empty()),
        })
    }

    /// Host portion of the endpoint, e.g. `ns.servicebus.windows.net`.
    #[must_use]
    pub fn host(&self) -> &str {
        self.endpoint
            .trim_start_matches("sb://")
            .trim_end_matches('/')
    }

    /// Reject `topic` when the connection string is scoped to another entity.
    pub fn check_entity(&self, topic: &str) -> Result<(), HubError> {
        match &self.entity_path {
            Some(path) if path != topic => Err(HubError::InvalidRequest {
                detail: format!("connection string targets {path}, not {topic}"),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .field("entity_path", &self.entity_path)
            .finish()
    }
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub body: Value,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl EventData {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }
}

/// Event as delivered to a handler, with service-owned delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    pub body: Value,
    pub properties: BTreeMap<String, String>,
    pub partition_id: String,
    pub offset: i64,
    pub sequence_number: i64,
    pub enqueued_time: SystemTime,
}

/// Outbound batch bounded by a byte budget.
#[derive(Debug, Clone)]
pub struct EventBatch {
    events: Vec<EventData>,
    size_bytes: usize,
    max_size_bytes: usize,
}

impl EventBatch {
    #[must_use]
    pub const fn with_max_size(max_size_bytes: usize) -> Self {
        Self {
            events: Vec::new(),
            size_bytes: 0,
            max_size_bytes,
        }
    }

    /// Add the event if it fits within the remaining budget.
    pub fn try_add(&mut self, event: EventData) -> bool {
        let len = event.encoded_len();
        match self.size_bytes.checked_add(len) {
            Some(total) if total <= self.max_size_bytes => {
                self.size_bytes = total;
                self.events.push(event);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn into_events(self) -> Vec<EventData> {
        self.events
    }
}

impl Default for EventBatch {
    fn default() -> Self {
        Self::with_max_size(DEFAULT_MAX_BATCH_BYTES)
    }
}

/// Where a subscription begins reading when no checkpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    Earliest,
    Latest,
    /// Start after the event at this offset.
    Offset(i64),
}

/// Options applied to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub start_position: StartPosition,
    pub max_batch_size: usize,
    /// Interval after which an empty batch is delivered.
    pub max_wait_time: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start_position: StartPosition::Latest,
            max_batch_size: 10,
            max_wait_time: Duration::from_secs(1),
        }
    }
}

/// Durable per-partition position store.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn update_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &str,
        offset: i64,
    ) -> Result<(), HubError>;

    async fn checkpoint(&self, consumer_group: &str, partition_id: &str) -> Option<i64>;
}

/// Partition-scoped context passed alongside each delivered batch.
#[derive(Clone)]
pub struct PartitionContext {
    pub partition_id: String,
    pub consumer_group: String,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl PartitionContext {
    pub fn new(
        partition_id: impl Into<String>,
        consumer_group: impl Into<String>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            consumer_group: consumer_group.into(),
            checkpoints,
        }
    }

    /// Mark `event` as processed for this partition and consumer group.
    pub async fn update_checkpoint(&self, event: &ReceivedEvent) -> Result<(), HubError> {
        if event.partition_id != self.partition_id {
            return Err(HubError::InvalidRequest {
                detail: format!(
                    "event from partition {} cannot be checkpointed on partition {}",
                    event.partition_id, self.partition_id
                ),
            });
        }
        self.checkpoints
            .update_checkpoint(&self.consumer_group, &self.partition_id, event.offset)
            .await
    }
}

impl fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionContext")
            .field("partition_id", &self.partition_id)
            .field("consumer_group", &self.consumer_group)
            .finish_non_exhaustive()
    }
}

/// Handler capability pair registered with a subscription.
///
/// An error returned from [`EventHandler::process_events`] is reported back
/// through [`EventHandler::process_error`] by the consumer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn process_events(
        &self,
        events: Vec<ReceivedEvent>,
        context: &PartitionContext,
    ) -> Result<(), HubError>;

    async fn process_error(&self, error: HubError, context: Option<&PartitionContext>);
}

/// Exchanges a service principal for a credential.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, principal: &ServicePrincipal) -> Result<Credential, HubError>;
}

/// Management-plane operations on topics.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_or_update_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
        options: &TopicOptions,
    ) -> Result<ManagementStatus, HubError>;

    async fn delete_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
    ) -> Result<ManagementStatus, HubError>;
}

#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn create_batch(&self) -> Result<EventBatch, HubError>;
    async fn send_batch(&self, batch: EventBatch) -> Result<(), HubError>;
    async fn close(&self) -> Result<(), HubError>;
}

/// Live handler registration; closed explicitly by its owner.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn is_running(&self) -> bool;
    async fn close(&self) -> Result<(), HubError>;
}

#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, HubError>;

    async fn close(&self) -> Result<(), HubError>;
}

/// Builds data-plane clients bound to a connection string and topic.
#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn producer(
        &self,
        connection: &ConnectionString,
        topic: &str,
    ) -> Result<Arc<dyn EventProducer>, HubError>;

    async fn consumer(
        &self,
        connection: &ConnectionString,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Arc<dyn EventConsumer>, HubError>;
}

/// The set of clients a harness run talks to.
#[derive(Clone)]
pub struct HubBackend {
    pub identity: Arc<dyn IdentityProvider>,
    pub admin: Arc<dyn TopicAdmin>,
    pub connector: Arc<dyn HubConnector>,
}

impl HubBackend {
    /// Backend where every client is served by the same in-memory hub.
    #[must_use]
    pub fn in_memory(hub: &InMemoryHub) -> Self {
        Self {
            identity: Arc::new(hub.clone()),
            admin: Arc::new(hub.clone()),
            connector: Arc::new(hub.clone()),
        }
    }
}

impl fmt::Debug for HubBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubBackend").finish_non_exhaustive()
    }
}
