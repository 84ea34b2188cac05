//! Producer, consumer and subscription clients over the SDK's AMQP clients.
//!
//! A subscription runs one pump task per partition. Each pump owns its
//! partition receiver, delivers up to `max_batch_size` events that are ready
//! together, and delivers an empty batch when nothing arrives within
//! `max_wait_time`. A receive error ends that partition's pump after it is
//! reported through `process_error`.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azure_messaging_eventhubs::models::ReceivedEventData;
use azure_messaging_eventhubs::{
    ConsumerClient, EventHubsError, EventReceiver, OpenReceiverOptions, ProducerClient,
};
use futures_util::{FutureExt, StreamExt};
use hub_contract::{
    CheckpointStore, EventBatch, EventConsumer, EventHandler, EventProducer, HubError,
    PartitionContext, ReceivedEvent, StartPosition, SubscribeOptions, Subscription,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::convert;
use crate::error::from_eventhubs;

pub(crate) struct AzureProducer {
    client: Mutex<Option<ProducerClient>>,
    topic: String,
}

impl AzureProducer {
    pub(crate) fn new(client: ProducerClient, topic: &str) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            topic: topic.to_string(),
        }
    }
}

#[async_trait]
impl EventProducer for AzureProducer {
    async fn create_batch(&self) -> Result<EventBatch, HubError> {
        if self.client.lock().await.is_none() {
            return Err(HubError::closed("producer is closed"));
        }
        Ok(EventBatch::default())
    }

    async fn send_batch(&self, batch: EventBatch) -> Result<(), HubError> {
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| HubError::closed("producer is closed"))?;
        let events = batch.into_events();
        if events.is_empty() {
            return Err(HubError::InvalidRequest {
                detail: "cannot send an empty batch".into(),
            });
        }
        let mut outgoing = client.create_batch(None).await.map_err(from_eventhubs)?;
        for event in &events {
            let added = outgoing
                .try_add_event_data(convert::outbound(event)?, None)
                .map_err(from_eventhubs)?;
            if !added {
                return Err(HubError::InvalidRequest {
                    detail: format!("event does not fit in a batch for {}", self.topic),
                });
            }
        }
        client
            .send_batch(outgoing, None)
            .await
            .map_err(from_eventhubs)?;
        debug!(topic = %self.topic, count = events.len(), "batch sent");
        Ok(())
    }

    async fn close(&self) -> Result<(), HubError> {
        let Some(client) = self.client.lock().await.take() else {
            return Err(HubError::closed("producer already closed"));
        };
        client.close().await.map_err(from_eventhubs)
    }
}

pub(crate) struct AzureConsumer {
    client: Mutex<Option<ConsumerClient>>,
    topic: String,
    consumer_group: String,
    checkpoints: Arc<dyn CheckpointStore>,
    shutdowns: Mutex<Vec<watch::Sender<bool>>>,
}

impl AzureConsumer {
    pub(crate) fn new(
        client: ConsumerClient,
        topic: &str,
        consumer_group: &str,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            checkpoints,
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    async fn open_partition(
        &self,
        client: &ConsumerClient,
        partition_id: &str,
        requested: StartPosition,
    ) -> Result<EventReceiver, HubError> {
        let checkpoint = self
            .checkpoints
            .checkpoint(&self.consumer_group, partition_id)
            .await;
        let last_enqueued = if checkpoint.is_none() && requested == StartPosition::Latest {
            let properties = client
                .get_partition_properties(partition_id)
                .await
                .map_err(from_eventhubs)?;
            (!properties.is_empty).then_some(properties.last_enqueued_sequence_number)
        } else {
            None
        };
        let start_position = convert::start_position(checkpoint, requested, last_enqueued);
        debug!(topic = %self.topic, partition_id, ?start_position, "opening receiver");
        client
            .open_receiver_on_partition(
                partition_id.to_string(),
                Some(OpenReceiverOptions {
                    start_position: Some(start_position),
                    ..Default::default()
                }),
            )
            .await
            .map_err(from_eventhubs)
    }
}

#[async_trait]
impl EventConsumer for AzureConsumer {
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, HubError> {
        if options.max_batch_size == 0 {
            return Err(HubError::InvalidRequest {
                detail: "max batch size must be at least 1".into(),
            });
        }
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| HubError::closed("consumer is closed"))?;
        let partition_ids = client
            .get_eventhub_properties()
            .await
            .map_err(from_eventhubs)?
            .partition_ids;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::with_capacity(partition_ids.len());
        for partition_id in partition_ids {
            let receiver = match self
                .open_partition(client, &partition_id, options.start_position)
                .await
            {
                Ok(receiver) => receiver,
                Err(err) => {
                    let _ = shutdown_tx.send(true);
                    for task in tasks {
                        let _ = task.await;
                    }
                    return Err(err);
                }
            };
            let pump = PartitionPump {
                context: PartitionContext::new(
                    partition_id,
                    self.consumer_group.clone(),
                    self.checkpoints.clone(),
                ),
                handler: handler.clone(),
                max_batch_size: options.max_batch_size,
                max_wait_time: options.max_wait_time,
                running: running.clone(),
            };
            running.fetch_add(1, Ordering::SeqCst);
            tasks.push(tokio::spawn(pump.run(receiver, shutdown_rx.clone())));
        }
        info!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            partitions = tasks.len(),
            "subscribed"
        );
        self.shutdowns.lock().await.push(shutdown_tx.clone());
        Ok(Box::new(AzureSubscription {
            shutdown: shutdown_tx,
            running,
            tasks: Mutex::new(Some(tasks)),
        }))
    }

    async fn close(&self) -> Result<(), HubError> {
        for shutdown in self.shutdowns.lock().await.drain(..) {
            let _ = shutdown.send(true);
        }
        let Some(client) = self.client.lock().await.take() else {
            return Err(HubError::closed("consumer already closed"));
        };
        client.close().await.map_err(from_eventhubs)
    }
}

struct AzureSubscription {
    shutdown: watch::Sender<bool>,
    running: Arc<AtomicUsize>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

#[async_trait]
impl Subscription for AzureSubscription {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    async fn close(&self) -> Result<(), HubError> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Err(HubError::closed("subscription already closed"));
        };
        let _ = self.shutdown.send(true);
        for task in tasks {
            if let Err(err) = task.await {
                return Err(HubError::Internal {
                    detail: format!("partition pump failed: {err}"),
                });
            }
        }
        Ok(())
    }
}

struct PartitionPump {
    context: PartitionContext,
    handler: Arc<dyn EventHandler>,
    max_batch_size: usize,
    max_wait_time: Duration,
    running: Arc<AtomicUsize>,
}

impl PartitionPump {
    async fn run(self, receiver: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        {
            let mut stream = pin!(receiver.stream_events());
            while !*shutdown.borrow() {
                let next = tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    next = tokio::time::timeout(self.max_wait_time, stream.next()) => next,
                };
                let first = match next {
                    Err(_) => {
                        self.deliver(Vec::new()).await;
                        continue;
                    }
                    Ok(None) => {
                        let error = HubError::closed(format!(
                            "receiver for partition {} ended",
                            self.context.partition_id
                        ));
                        self.handler.process_error(error, Some(&self.context)).await;
                        break;
                    }
                    Ok(Some(Err(err))) => {
                        self.report(err).await;
                        break;
                    }
                    Ok(Some(Ok(event))) => event,
                };

                let mut ready = vec![first];
                let mut failure = None;
                while ready.len() < self.max_batch_size {
                    match stream.next().now_or_never() {
                        Some(Some(Ok(event))) => ready.push(event),
                        Some(Some(Err(err))) => {
                            failure = Some(err);
                            break;
                        }
                        Some(None) | None => break,
                    }
                }
                let events = self.convert(&ready).await;
                self.deliver(events).await;
                if let Some(err) = failure {
                    self.report(err).await;
                    break;
                }
            }
        }
        if let Err(err) = receiver.close().await {
            debug!(partition_id = %self.context.partition_id, %err, "receiver close failed");
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    async fn convert(&self, ready: &[ReceivedEventData]) -> Vec<ReceivedEvent> {
        let mut events = Vec::with_capacity(ready.len());
        for event in ready {
            match convert::received(&self.context.partition_id, event) {
                Ok(event) => events.push(event),
                Err(error) => {
                    warn!(partition_id = %self.context.partition_id, %error, "undecodable event");
                    self.handler.process_error(error, Some(&self.context)).await;
                }
            }
        }
        events
    }

    async fn deliver(&self, events: Vec<ReceivedEvent>) {
        if !events.is_empty() {
            debug!(
                partition_id = %self.context.partition_id,
                count = events.len(),
                "delivering batch"
            );
        }
        if let Err(error) = self.handler.process_events(events, &self.context).await {
            self.handler.process_error(error, Some(&self.context)).await;
        }
    }

    async fn report(&self, err: EventHubsError) {
        self.handler
            .process_error(from_eventhubs(err), Some(&self.context))
            .await;
    }
}
