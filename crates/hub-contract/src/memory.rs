//! Scripted in-memory implementation of every hub client, for tests and dry runs.
//!
//! The hub records each call it serves as a [`HubCall`] so scenarios can
//! assert ordering and exactly-once teardown. Faults are scripted up front and
//! consumed in FIFO order by the next matching operation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::{
    CheckpointStore, ConnectionString, Credential, EventBatch, EventConsumer, EventData,
    EventHandler, EventProducer, HubConnector, HubError, IdentityProvider, ManagementStatus,
    PartitionContext, ReceivedEvent, ServicePrincipal, StartPosition, SubscribeOptions,
    Subscription, TopicAdmin, TopicLocator, TopicOptions,
};

const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Delivery behaviour applied to the next sent batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFault {
    /// Every event in the batch is stored twice.
    Duplicate,
    /// The batch is acknowledged but never stored.
    Drop,
    /// The batch is stored after the given delay.
    Delay(Duration),
    /// The batch is stored and the consumer reports this error once.
    ReceiveError(HubError),
}

/// Resource whose next `close()` should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseTarget {
    Subscription,
    Producer,
    Consumer,
}

/// Call recorded by [`InMemoryHub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCall {
    Authenticate {
        client_id: String,
    },
    CreateOrUpdateTopic {
        topic: String,
        status: u16,
    },
    DeleteTopic {
        topic: String,
        status: u16,
    },
    ConnectProducer {
        topic: String,
    },
    ConnectConsumer {
        topic: String,
        consumer_group: String,
    },
    Subscribe {
        topic: String,
        consumer_group: String,
        start_position: StartPosition,
    },
    SendBatch {
        topic: String,
        events: usize,
    },
    Checkpoint {
        topic: String,
        partition_id: String,
        offset: i64,
    },
    CloseSubscription,
    CloseProducer,
    CloseConsumer,
}

#[derive(Debug, Default)]
struct TopicState {
    options: TopicOptions,
    partitions: Vec<Vec<ReceivedEvent>>,
    next_partition: usize,
    receive_errors: VecDeque<HubError>,
}

impl TopicState {
    fn new(options: TopicOptions) -> Self {
        let count = options.partition_count.max(1) as usize;
        Self {
            options,
            partitions: vec![Vec::new(); count],
            next_partition: 0,
            receive_errors: VecDeque::new(),
        }
    }

    fn append(&mut self, events: &[EventData]) {
        let partition = self.next_partition % self.partitions.len();
        self.next_partition = self.next_partition.wrapping_add(1);
        let log = &mut self.partitions[partition];
        for event in events {
            let offset = log.len() as i64;
            log.push(ReceivedEvent {
                body: event.body.clone(),
                properties: event.properties.clone(),
                partition_id: partition.to_string(),
                offset,
                sequence_number: offset,
                enqueued_time: SystemTime::now(),
            });
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    accepted: Option<ServicePrincipal>,
    issued_tokens: HashSet<String>,
    topics: HashMap<String, TopicState>,
    checkpoints: HashMap<(String, String, String), i64>,
    calls: Vec<HubCall>,
    delivery_faults: VecDeque<DeliveryFault>,
    admin_statuses: VecDeque<ManagementStatus>,
    close_failures: HashSet<CloseTarget>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<HubState>,
    appended: watch::Sender<u64>,
}

/// In-memory hub serving identity, admin, and data-plane clients.
#[derive(Debug, Clone)]
pub struct InMemoryHub {
    inner: Arc<Inner>,
}

impl Default for InMemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHub {
    #[must_use]
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HubState::default()),
                appended,
            }),
        }
    }

    /// Only accept credentials for `principal`; any principal is accepted otherwise.
    pub async fn accept_only(&self, principal: ServicePrincipal) {
        self.inner.state.lock().await.accepted = Some(principal);
    }

    /// Queue a fault for the next sent batch.
    pub async fn script_delivery(&self, fault: DeliveryFault) {
        self.inner.state.lock().await.delivery_faults.push_back(fault);
    }

    /// Queue the status returned by the next management call.
    pub async fn script_admin_status(&self, status: ManagementStatus) {
        self.inner.state.lock().await.admin_statuses.push_back(status);
    }

    /// Make the next `close()` of `target` fail after releasing the resource.
    pub async fn fail_next_close(&self, target: CloseTarget) {
        self.inner.state.lock().await.close_failures.insert(target);
    }

    pub async fn calls(&self) -> Vec<HubCall> {
        self.inner.state.lock().await.calls.clone()
    }

    pub async fn topic_exists(&self, topic: &str) -> bool {
        self.inner.state.lock().await.topics.contains_key(topic)
    }

    /// Options the topic currently carries; partition count is fixed at creation.
    pub async fn topic_options(&self, topic: &str) -> Option<TopicOptions> {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map(|state| state.options)
    }

    /// Every stored event of `topic`, partition by partition.
    pub async fn events(&self, topic: &str) -> Vec<ReceivedEvent> {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map(|state| state.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn checkpoint_of(
        &self,
        topic: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> Option<i64> {
        self.inner
            .state
            .lock()
            .await
            .checkpoints
            .get(&(
                topic.to_string(),
                consumer_group.to_string(),
                partition_id.to_string(),
            ))
            .copied()
    }

    async fn record(&self, call: HubCall) {
        self.inner.state.lock().await.calls.push(call);
    }

    async fn take_close_failure(&self, target: CloseTarget) -> bool {
        self.inner.state.lock().await.close_failures.remove(&target)
    }

    async fn append(&self, topic: &str, events: &[EventData]) -> Result<(), HubError> {
        {
            let mut state = self.inner.state.lock().await;
            let topic_state = state.topics.get_mut(topic).ok_or_else(|| HubError::NotFound {
                detail: format!("topic {topic} does not exist"),
            })?;
            topic_state.append(events);
        }
        self.inner.appended.send_modify(|generation| *generation += 1);
        Ok(())
    }

    fn check_token(state: &HubState, credential: &Credential) -> Result<(), HubError> {
        if !state.issued_tokens.contains(&credential.access_token) {
            return Err(HubError::Unauthorized {
                detail: "credential was not issued by this hub".into(),
            });
        }
        if credential.is_expired_at(SystemTime::now()) {
            return Err(HubError::Unauthorized {
                detail: "credential expired".into(),
            });
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<usize, HubError> {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map(|state| state.partitions.len())
            .ok_or_else(|| HubError::NotFound {
                detail: format!("topic {topic} does not exist"),
            })
    }

    async fn read_partition(
        &self,
        topic: &str,
        partition: usize,
        cursor: usize,
        max: usize,
    ) -> Result<Vec<ReceivedEvent>, HubError> {
        let state = self.inner.state.lock().await;
        let log = state
            .topics
            .get(topic)
            .and_then(|topic_state| topic_state.partitions.get(partition))
            .ok_or_else(|| HubError::NotFound {
                detail: format!("topic {topic} partition {partition} does not exist"),
            })?;
        Ok(log.iter().skip(cursor).take(max).cloned().collect())
    }

    async fn take_receive_error(&self, topic: &str) -> Option<HubError> {
        self.inner
            .state
            .lock()
            .await
            .topics
            .get_mut(topic)
            .and_then(|state| state.receive_errors.pop_front())
    }

    async fn initial_cursors(
        &self,
        topic: &str,
        consumer_group: &str,
        start: StartPosition,
    ) -> Result<Vec<usize>, HubError> {
        let state = self.inner.state.lock().await;
        let topic_state = state.topics.get(topic).ok_or_else(|| HubError::NotFound {
            detail: format!("topic {topic} does not exist"),
        })?;
        let cursors = topic_state
            .partitions
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let key = (
                    topic.to_string(),
                    consumer_group.to_string(),
                    partition.to_string(),
                );
                let after = |offset: i64| usize::try_from(offset + 1).unwrap_or(0).min(log.len());
                match state.checkpoints.get(&key) {
                    Some(offset) => after(*offset),
                    None => match start {
                        StartPosition::Earliest => 0,
                        StartPosition::Latest => log.len(),
                        StartPosition::Offset(offset) => after(offset),
                    },
                }
            })
            .collect();
        Ok(cursors)
    }
}

#[async_trait]
impl IdentityProvider for InMemoryHub {
    async fn authenticate(&self, principal: &ServicePrincipal) -> Result<Credential, HubError> {
        let mut state = self.inner.state.lock().await;
        state.calls.push(HubCall::Authenticate {
            client_id: principal.client_id.clone(),
        });
        if principal.client_secret.is_empty() {
            return Err(HubError::Unauthorized {
                detail: "client secret is empty".into(),
            });
        }
        if let Some(accepted) = &state.accepted {
            if accepted != principal {
                return Err(HubError::Unauthorized {
                    detail: format!("client {} rejected", principal.client_id),
                });
            }
        }
        let token = format!("memory-{}", Uuid::new_v4());
        state.issued_tokens.insert(token.clone());
        Ok(Credential {
            access_token: token,
            expires_at: SystemTime::now() + TOKEN_LIFETIME,
            tenant_id: principal.tenant_id.clone(),
        })
    }
}

#[async_trait]
impl TopicAdmin for InMemoryHub {
    async fn create_or_update_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
        options: &TopicOptions,
    ) -> Result<ManagementStatus, HubError> {
        let mut state = self.inner.state.lock().await;
        Self::check_token(&state, credential)?;
        let status = if let Some(scripted) = state.admin_statuses.pop_front() {
            scripted
        } else if let Some(existing) = state.topics.get_mut(&topic.topic) {
            existing.options.retention_days = options.retention_days;
            ManagementStatus::OK
        } else {
            state
                .topics
                .insert(topic.topic.clone(), TopicState::new(*options));
            ManagementStatus::CREATED
        };
        state.calls.push(HubCall::CreateOrUpdateTopic {
            topic: topic.topic.clone(),
            status: status.0,
        });
        Ok(status)
    }

    async fn delete_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
    ) -> Result<ManagementStatus, HubError> {
        let mut state = self.inner.state.lock().await;
        Self::check_token(&state, credential)?;
        let status = if let Some(scripted) = state.admin_statuses.pop_front() {
            scripted
        } else if state.topics.remove(&topic.topic).is_some() {
            state.checkpoints.retain(|(name, _, _), _| name != &topic.topic);
            ManagementStatus::OK
        } else {
            ManagementStatus::NOT_FOUND
        };
        state.calls.push(HubCall::DeleteTopic {
            topic: topic.topic.clone(),
            status: status.0,
        });
        Ok(status)
    }
}

#[async_trait]
impl HubConnector for InMemoryHub {
    async fn producer(
        &self,
        connection: &ConnectionString,
        topic: &str,
    ) -> Result<Arc<dyn EventProducer>, HubError> {
        connection.check_entity(topic)?;
        self.record(HubCall::ConnectProducer {
            topic: topic.to_string(),
        })
        .await;
        Ok(Arc::new(InMemoryProducer {
            hub: self.clone(),
            topic: topic.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consumer(
        &self,
        connection: &ConnectionString,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Arc<dyn EventConsumer>, HubError> {
        connection.check_entity(topic)?;
        self.record(HubCall::ConnectConsumer {
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
        })
        .await;
        Ok(Arc::new(InMemoryConsumer {
            hub: self.clone(),
            topic: topic.to_string(),
            consumer_group: consumer_group.to_string(),
            closed: AtomicBool::new(false),
            shutdowns: Mutex::new(Vec::new()),
        }))
    }
}

struct InMemoryProducer {
    hub: InMemoryHub,
    topic: String,
    closed: AtomicBool,
}

#[async_trait]
impl EventProducer for InMemoryProducer {
    async fn create_batch(&self) -> Result<EventBatch, HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::closed("producer is closed"));
        }
        Ok(EventBatch::default())
    }

    async fn send_batch(&self, batch: EventBatch) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::closed("producer is closed"));
        }
        if batch.is_empty() {
            return Err(HubError::InvalidRequest {
                detail: "cannot send an empty batch".into(),
            });
        }
        let events = batch.into_events();
        let fault = {
            let mut state = self.hub.inner.state.lock().await;
            if !state.topics.contains_key(&self.topic) {
                return Err(HubError::NotFound {
                    detail: format!("topic {} does not exist", self.topic),
                });
            }
            state.calls.push(HubCall::SendBatch {
                topic: self.topic.clone(),
                events: events.len(),
            });
            state.delivery_faults.pop_front()
        };
        match fault {
            None => self.hub.append(&self.topic, &events).await,
            Some(DeliveryFault::Duplicate) => {
                let doubled: Vec<EventData> = events
                    .iter()
                    .flat_map(|event| [event.clone(), event.clone()])
                    .collect();
                self.hub.append(&self.topic, &doubled).await
            }
            Some(DeliveryFault::Drop) => {
                debug!(topic = %self.topic, "dropping batch by script");
                Ok(())
            }
            Some(DeliveryFault::Delay(delay)) => {
                let hub = self.hub.clone();
                let topic = self.topic.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = hub.append(&topic, &events).await {
                        debug!(%topic, %err, "delayed append failed");
                    }
                });
                Ok(())
            }
            Some(DeliveryFault::ReceiveError(error)) => {
                {
                    let mut state = self.hub.inner.state.lock().await;
                    if let Some(topic_state) = state.topics.get_mut(&self.topic) {
                        topic_state.receive_errors.push_back(error);
                    }
                }
                self.hub.append(&self.topic, &events).await
            }
        }
    }

    async fn close(&self) -> Result<(), HubError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(HubError::closed("producer already closed"));
        }
        self.hub.record(HubCall::CloseProducer).await;
        if self.hub.take_close_failure(CloseTarget::Producer).await {
            return Err(HubError::transport("scripted producer close failure"));
        }
        Ok(())
    }
}

struct InMemoryConsumer {
    hub: InMemoryHub,
    topic: String,
    consumer_group: String,
    closed: AtomicBool,
    shutdowns: Mutex<Vec<watch::Sender<bool>>>,
}

#[async_trait]
impl EventConsumer for InMemoryConsumer {
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::closed("consumer is closed"));
        }
        if options.max_batch_size == 0 {
            return Err(HubError::InvalidRequest {
                detail: "max batch size must be at least 1".into(),
            });
        }
        let cursors = self
            .hub
            .initial_cursors(&self.topic, &self.consumer_group, options.start_position)
            .await?;
        self.hub
            .record(HubCall::Subscribe {
                topic: self.topic.clone(),
                consumer_group: self.consumer_group.clone(),
                start_position: options.start_position,
            })
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdowns.lock().await.push(shutdown_tx.clone());
        let running = Arc::new(AtomicBool::new(true));
        let loop_state = DeliveryLoop {
            hub: self.hub.clone(),
            topic: self.topic.clone(),
            checkpoints: Arc::new(TopicCheckpoints {
                hub: self.hub.clone(),
                topic: self.topic.clone(),
            }),
            consumer_group: self.consumer_group.clone(),
            handler,
            options,
            cursors,
            running: running.clone(),
        };
        let task = tokio::spawn(loop_state.run(shutdown_rx));
        Ok(Box::new(InMemorySubscription {
            hub: self.hub.clone(),
            shutdown: shutdown_tx,
            running,
            task: Mutex::new(Some(task)),
        }))
    }

    async fn close(&self) -> Result<(), HubError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(HubError::closed("consumer already closed"));
        }
        for shutdown in self.shutdowns.lock().await.drain(..) {
            let _ = shutdown.send(true);
        }
        self.hub.record(HubCall::CloseConsumer).await;
        if self.hub.take_close_failure(CloseTarget::Consumer).await {
            return Err(HubError::transport("scripted consumer close failure"));
        }
        Ok(())
    }
}

struct InMemorySubscription {
    hub: InMemoryHub,
    shutdown: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), HubError> {
        let Some(task) = self.task.lock().await.take() else {
            return Err(HubError::closed("subscription already closed"));
        };
        let _ = self.shutdown.send(true);
        if let Err(err) = task.await {
            return Err(HubError::Internal {
                detail: format!("delivery task failed: {err}"),
            });
        }
        self.hub.record(HubCall::CloseSubscription).await;
        if self.hub.take_close_failure(CloseTarget::Subscription).await {
            return Err(HubError::transport("scripted subscription close failure"));
        }
        Ok(())
    }
}

struct TopicCheckpoints {
    hub: InMemoryHub,
    topic: String,
}

#[async_trait]
impl CheckpointStore for TopicCheckpoints {
    async fn update_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &str,
        offset: i64,
    ) -> Result<(), HubError> {
        let mut state = self.hub.inner.state.lock().await;
        if !state.topics.contains_key(&self.topic) {
            return Err(HubError::NotFound {
                detail: format!("topic {} does not exist", self.topic),
            });
        }
        state.checkpoints.insert(
            (
                self.topic.clone(),
                consumer_group.to_string(),
                partition_id.to_string(),
            ),
            offset,
        );
        state.calls.push(HubCall::Checkpoint {
            topic: self.topic.clone(),
            partition_id: partition_id.to_string(),
            offset,
        });
        Ok(())
    }

    async fn checkpoint(&self, consumer_group: &str, partition_id: &str) -> Option<i64> {
        self.hub
            .checkpoint_of(&self.topic, consumer_group, partition_id)
            .await
    }
}

struct DeliveryLoop {
    hub: InMemoryHub,
    topic: String,
    checkpoints: Arc<TopicCheckpoints>,
    consumer_group: String,
    handler: Arc<dyn EventHandler>,
    options: SubscribeOptions,
    cursors: Vec<usize>,
    running: Arc<AtomicBool>,
}

impl DeliveryLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut appended = self.hub.inner.appended.subscribe();
        while !*shutdown.borrow() {
            if let Some(error) = self.hub.take_receive_error(&self.topic).await {
                self.handler.process_error(error, None).await;
            }
            match self.deliver_available().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(error) => {
                    self.handler.process_error(error, None).await;
                    break;
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = appended.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.options.max_wait_time) => {
                    self.deliver_empty().await;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn context(&self, partition: usize) -> PartitionContext {
        PartitionContext::new(
            partition.to_string(),
            self.consumer_group.clone(),
            self.checkpoints.clone(),
        )
    }

    /// Returns whether any partition had events.
    async fn deliver_available(&mut self) -> Result<bool, HubError> {
        let partitions = self.hub.partition_count(&self.topic).await?;
        let mut delivered = false;
        for partition in 0..partitions.min(self.cursors.len()) {
            let events = self
                .hub
                .read_partition(
                    &self.topic,
                    partition,
                    self.cursors[partition],
                    self.options.max_batch_size,
                )
                .await?;
            if events.is_empty() {
                continue;
            }
            delivered = true;
            self.cursors[partition] += events.len();
            debug!(topic = %self.topic, partition, count = events.len(), "delivering batch");
            let context = self.context(partition);
            if let Err(error) = self.handler.process_events(events, &context).await {
                self.handler.process_error(error, Some(&context)).await;
            }
        }
        Ok(delivered)
    }

    async fn deliver_empty(&self) {
        for partition in 0..self.cursors.len() {
            let context = self.context(partition);
            if let Err(error) = self.handler.process_events(Vec::new(), &context).await {
                self.handler.process_error(error, Some(&context)).await;
            }
        }
    }
}
