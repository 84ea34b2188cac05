//! Event hub backend on the Azure SDK: service principal identity and the
//! AMQP data plane (producer, consumer, per-partition subscriptions).
//!
//! The identity provider keeps the token credential it built so the
//! connector can open data-plane clients for the same principal; connecting
//! before authenticating is refused.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use azure_core::credentials::{Secret, TokenCredential};
use azure_identity::ClientSecretCredential;
use azure_messaging_eventhubs::{ConsumerClient, InMemoryCheckpointStore, ProducerClient};
use hub_contract::{
    ConnectionString, Credential, EventConsumer, EventProducer, HubBackend, HubConnector,
    HubError, IdentityProvider, ServicePrincipal, TopicAdmin,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

mod checkpoint;
mod client;
mod convert;
mod error;

pub use checkpoint::SdkCheckpoints;

use crate::client::{AzureConsumer, AzureProducer};
use crate::error::{from_core, from_eventhubs};

/// Scope requested when no other audience is configured.
pub const DEFAULT_TOKEN_SCOPE: &str = "https://management.azure.com/.default";

/// Identity provider and data-plane connector backed by the Azure SDK.
pub struct AzureHub {
    token_scope: String,
    credential: Mutex<Option<Arc<dyn TokenCredential>>>,
    checkpoints: Arc<dyn azure_messaging_eventhubs::CheckpointStore>,
}

impl AzureHub {
    /// `token_scope` is the audience of the credential handed back by
    /// [`IdentityProvider::authenticate`], normally the management plane.
    pub fn new(token_scope: impl Into<String>) -> Self {
        Self {
            token_scope: token_scope.into(),
            credential: Mutex::new(None),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }

    /// Persist consumer checkpoints in `store` instead of process memory.
    #[must_use]
    pub fn with_checkpoint_store(
        mut self,
        store: Arc<dyn azure_messaging_eventhubs::CheckpointStore>,
    ) -> Self {
        self.checkpoints = store;
        self
    }

    /// Bundle this hub as identity and connector alongside `admin`.
    #[must_use]
    pub fn into_backend(self, admin: Arc<dyn TopicAdmin>) -> HubBackend {
        let hub = Arc::new(self);
        HubBackend {
            identity: hub.clone(),
            admin,
            connector: hub,
        }
    }

    async fn token_credential(&self) -> Result<Arc<dyn TokenCredential>, HubError> {
        self.credential
            .lock()
            .await
            .clone()
            .ok_or_else(|| HubError::Unauthorized {
                detail: "no service principal has been authenticated".into(),
            })
    }
}

impl Default for AzureHub {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_SCOPE)
    }
}

impl fmt::Debug for AzureHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureHub")
            .field("token_scope", &self.token_scope)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for AzureHub {
    async fn authenticate(&self, principal: &ServicePrincipal) -> Result<Credential, HubError> {
        let credential: Arc<dyn TokenCredential> = ClientSecretCredential::new(
            &principal.tenant_id,
            principal.client_id.clone(),
            Secret::new(principal.client_secret.clone()),
            None,
        )
        .map_err(|err| from_core(&err))?;
        let token = credential
            .get_token(&[self.token_scope.as_str()], None)
            .await
            .map_err(|err| from_core(&err))?;
        debug!(client_id = %principal.client_id, scope = %self.token_scope, "token issued");
        *self.credential.lock().await = Some(credential);
        Ok(Credential {
            access_token: token.token.secret().to_string(),
            expires_at: SystemTime::from(token.expires_on),
            tenant_id: principal.tenant_id.clone(),
        })
    }
}

#[async_trait]
impl HubConnector for AzureHub {
    async fn producer(
        &self,
        connection: &ConnectionString,
        topic: &str,
    ) -> Result<Arc<dyn EventProducer>, HubError> {
        connection.check_entity(topic)?;
        let credential = self.token_credential().await?;
        let client = ProducerClient::builder()
            .open(connection.host(), topic, credential)
            .await
            .map_err(from_eventhubs)?;
        info!(namespace = connection.host(), topic, "producer connected");
        Ok(Arc::new(AzureProducer::new(client, topic)))
    }

    async fn consumer(
        &self,
        connection: &ConnectionString,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Arc<dyn EventConsumer>, HubError> {
        connection.check_entity(topic)?;
        let credential = self.token_credential().await?;
        let client = ConsumerClient::builder()
            .with_consumer_group(consumer_group.to_string())
            .open(connection.host(), topic.to_string(), credential)
            .await
            .map_err(from_eventhubs)?;
        info!(namespace = connection.host(), topic, consumer_group, "consumer connected");
        let checkpoints = Arc::new(SdkCheckpoints::new(
            self.checkpoints.clone(),
            connection.host(),
            topic,
        ));
        Ok(Arc::new(AzureConsumer::new(
            client,
            topic,
            consumer_group,
            checkpoints,
        )))
    }
}
