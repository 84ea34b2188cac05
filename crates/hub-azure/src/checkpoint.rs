use std::sync::Arc;

use async_trait::async_trait;
use azure_messaging_eventhubs::models::Checkpoint;
use hub_contract::{CheckpointStore, HubError};
use tracing::warn;

use crate::error::from_core;

/// Contract checkpoint store backed by an SDK checkpoint store, scoped to one topic.
pub struct SdkCheckpoints {
    store: Arc<dyn azure_messaging_eventhubs::CheckpointStore>,
    namespace: String,
    event_hub: String,
}

impl SdkCheckpoints {
    pub fn new(
        store: Arc<dyn azure_messaging_eventhubs::CheckpointStore>,
        namespace: impl Into<String>,
        event_hub: impl Into<String>,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            event_hub: event_hub.into(),
        }
    }
}

#[async_trait]
impl CheckpointStore for SdkCheckpoints {
    async fn update_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &str,
        offset: i64,
    ) -> Result<(), HubError> {
        self.store
            .update_checkpoint(Checkpoint {
                fully_qualified_namespace: self.namespace.clone(),
                event_hub_name: self.event_hub.clone(),
                consumer_group: consumer_group.to_string(),
                partition_id: partition_id.to_string(),
                offset: Some(offset.to_string()),
                sequence_number: None,
            })
            .await
            .map_err(|err| from_core(&err))
    }

    async fn checkpoint(&self, consumer_group: &str, partition_id: &str) -> Option<i64> {
        let listed = self
            .store
            .list_checkpoints(&self.namespace, &self.event_hub, consumer_group)
            .await;
        let checkpoints = match listed {
            Ok(checkpoints) => checkpoints,
            Err(err) => {
                warn!(%err, partition_id, "listing checkpoints failed");
                return None;
            }
        };
        checkpoints
            .into_iter()
            .find(|checkpoint| checkpoint.partition_id == partition_id)
            .and_then(|checkpoint| checkpoint.offset)
            .and_then(|offset| offset.parse().ok())
    }
}
