use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hub_contract::{
    ConnectionString, Credential, DeliveryFault, EventBatch, EventConsumer, EventData,
    EventHandler, EventProducer, HubBackend, HubCall, HubConnector, HubError, IdentityProvider,
    InMemoryHub, ManagementStatus, ServicePrincipal, SubscribeOptions, Subscription, TopicAdmin,
    TopicLocator, TopicOptions,
};
use repro_harness::{
    HarnessConfig, HarnessError, Phase, ReproHarness, RunSettings, TeardownResource,
    TestContext, VerificationFailure,
};
use serde_json::json;

const TOPIC: &str = "repro-482913";

fn principal() -> ServicePrincipal {
    ServicePrincipal {
        tenant_id: "tenant-a".into(),
        client_id: "client-a".into(),
        client_secret: "secret-a".into(),
    }
}

fn locator() -> TopicLocator {
    TopicLocator {
        subscription_id: "sub-a".into(),
        resource_group: "rg-a".into(),
        namespace: "ns-a".into(),
        topic: TOPIC.into(),
    }
}

fn connection(entity_path: Option<&str>) -> ConnectionString {
    let mut raw =
        String::from("Endpoint=sb://ns-a.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=a2V5");
    if let Some(path) = entity_path {
        raw.push_str(";EntityPath=");
        raw.push_str(path);
    }
    ConnectionString::parse(&raw).expect("valid connection string")
}

fn config() -> HarnessConfig {
    HarnessConfig {
        principal: principal(),
        topic: locator(),
        connection: connection(Some(TOPIC)),
    }
}

fn settings() -> RunSettings {
    RunSettings {
        settle_timeout_ms: 2_000,
        linger_ms: 100,
        max_wait_ms: 25,
        ..RunSettings::default()
    }
}

fn harness_for(hub: &InMemoryHub, config: HarnessConfig, settings: RunSettings) -> ReproHarness {
    ReproHarness::new(config, settings, HubBackend::in_memory(hub)).expect("harness builds")
}

#[tokio::test]
async fn single_send_is_received_once_with_matching_id() -> anyhow::Result<()> {
    let hub = InMemoryHub::new();
    hub.accept_only(principal()).await;
    let harness = harness_for(&hub, config(), settings());

    let context = Arc::new(TestContext::with_test_id("482913", 1));
    let report = harness.execute_with(context).await.into_result()?;

    assert_eq!(report.test_id, "482913");
    assert_eq!(report.received.len(), 1);
    assert_eq!(report.received[0].body, json!({ "test_id": "482913" }));
    assert!(report.errors.is_empty());
    assert!(!hub.topic_exists(TOPIC).await);

    let phases: Vec<Phase> = report.phases.iter().map(|timing| timing.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Authenticate,
            Phase::EnsureTopic,
            Phase::ConnectClients,
            Phase::ConnectClients,
            Phase::Subscribe,
            Phase::Send,
            Phase::Send,
            Phase::AwaitDelivery,
            Phase::Verify,
            Phase::Teardown,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn multi_partition_topic_still_yields_one_event() -> anyhow::Result<()> {
    let hub = InMemoryHub::new();
    let settings = RunSettings {
        partition_count: 4,
        ..settings()
    };
    let report = harness_for(&hub, config(), settings).run().await?;
    assert_eq!(report.received.len(), 1);
    Ok(())
}

#[tokio::test]
async fn existing_topic_is_updated_and_history_is_ignored() -> anyhow::Result<()> {
    let hub = InMemoryHub::new();
    let credential = hub.authenticate(&principal()).await?;
    let created = hub
        .create_or_update_topic(&credential, &locator(), &Default::default())
        .await?;
    assert_eq!(created, ManagementStatus::CREATED);

    let producer = hub.producer(&connection(None), TOPIC).await?;
    let mut batch = producer.create_batch().await?;
    assert!(batch.try_add(EventData::new(json!({ "test_id": "stale" }))));
    producer.send_batch(batch).await?;
    producer.close().await?;

    let report = harness_for(&hub, config(), settings()).run().await?;
    assert_eq!(report.received.len(), 1);
    assert_eq!(report.received[0].offset, 1);
    assert!(hub.calls().await.contains(&HubCall::CreateOrUpdateTopic {
        topic: TOPIC.into(),
        status: 200,
    }));
    Ok(())
}

#[tokio::test]
async fn duplicated_delivery_is_reported_not_truncated() {
    let hub = InMemoryHub::new();
    hub.script_delivery(DeliveryFault::Duplicate).await;
    let settings = RunSettings {
        settle_timeout_ms: 300,
        ..settings()
    };

    let outcome = harness_for(&hub, config(), settings).execute().await;
    assert_eq!(
        outcome.result,
        Err(HarnessError::Verification(VerificationFailure::ReceivedCount {
            expected: 1,
            actual: 0,
        }))
    );
    assert_eq!(outcome.report.errors.len(), 1);
    match &outcome.report.errors[0] {
        HubError::Unexpected { detail } => assert!(detail.contains("batch of 2 events")),
        other => panic!("unexpected handler error: {other:?}"),
    }
    assert!(!hub.topic_exists(TOPIC).await);
}

#[tokio::test]
async fn receive_error_fails_run_after_successful_delivery() {
    let hub = InMemoryHub::new();
    hub.script_delivery(DeliveryFault::ReceiveError(HubError::transport(
        "link detached",
    )))
    .await;
    let settings = RunSettings {
        linger_ms: 300,
        ..settings()
    };

    let outcome = harness_for(&hub, config(), settings).execute().await;
    assert_eq!(outcome.report.received.len(), 1);
    assert!(matches!(
        outcome.result,
        Err(HarnessError::Verification(
            VerificationFailure::HandlerErrors { count: 1, .. }
        ))
    ));
}

#[tokio::test]
async fn late_delivery_past_settle_timeout_is_a_shortfall() {
    let hub = InMemoryHub::new();
    hub.script_delivery(DeliveryFault::Delay(std::time::Duration::from_millis(
        500,
    )))
    .await;
    let settings = RunSettings {
        settle_timeout_ms: 100,
        ..settings()
    };

    let outcome = harness_for(&hub, config(), settings).execute().await;
    assert!(matches!(
        outcome.result,
        Err(HarnessError::Verification(
            VerificationFailure::ReceivedCount { actual: 0, .. }
        ))
    ));
    assert!(!outcome.report.passed);
    assert!(outcome.report.failure.is_some());
}

#[tokio::test]
async fn client_failure_releases_topic_without_touching_unopened_clients() {
    let hub = InMemoryHub::new();
    let mut config = config();
    config.connection = connection(Some("some-other-topic"));

    let outcome = harness_for(&hub, config, settings()).execute().await;
    assert!(matches!(
        outcome.result,
        Err(HarnessError::Phase {
            phase: Phase::ConnectClients,
            source: HubError::InvalidRequest { .. },
        })
    ));
    assert_eq!(outcome.report.teardown.len(), 1);
    assert!(outcome.report.teardown[0].ok);
    assert!(!hub.topic_exists(TOPIC).await);
}

/// Delegates to the hub but refuses to delete anything.
struct StickyTopics(InMemoryHub);

#[async_trait]
impl TopicAdmin for StickyTopics {
    async fn create_or_update_topic(
        &self,
        credential: &Credential,
        topic: &TopicLocator,
        options: &TopicOptions,
    ) -> Result<ManagementStatus, HubError> {
        self.0.create_or_update_topic(credential, topic, options).await
    }

    async fn delete_topic(
        &self,
        _credential: &Credential,
        _topic: &TopicLocator,
    ) -> Result<ManagementStatus, HubError> {
        Ok(ManagementStatus(500))
    }
}

#[tokio::test]
async fn failed_topic_delete_is_reported_after_a_passing_run() {
    let hub = InMemoryHub::new();
    let backend = HubBackend {
        admin: Arc::new(StickyTopics(hub.clone())),
        ..HubBackend::in_memory(&hub)
    };
    let harness = ReproHarness::new(config(), settings(), backend).expect("harness builds");

    let outcome = harness.execute().await;
    assert_eq!(outcome.report.received.len(), 1);
    match outcome.result {
        Err(HarnessError::Teardown { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].resource, TeardownResource::Topic);
            assert!(failures[0].detail.contains("500"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(hub.topic_exists(TOPIC).await);
}

/// How [`QuirkyConnector`] departs from the hub it wraps.
#[derive(Clone, Copy)]
enum Quirk {
    /// Producers hand out batches too small for any event.
    TinyBatches,
    /// Subscription `close()` never returns.
    HangingSubscriptionClose,
}

struct QuirkyConnector {
    hub: InMemoryHub,
    quirk: Quirk,
}

#[async_trait]
impl HubConnector for QuirkyConnector {
    async fn producer(
        &self,
        connection: &ConnectionString,
        topic: &str,
    ) -> Result<Arc<dyn EventProducer>, HubError> {
        let inner = self.hub.producer(connection, topic).await?;
        Ok(Arc::new(QuirkyProducer {
            inner,
            quirk: self.quirk,
        }))
    }

    async fn consumer(
        &self,
        connection: &ConnectionString,
        consumer_group: &str,
        topic: &str,
    ) -> Result<Arc<dyn EventConsumer>, HubError> {
        let inner = self.hub.consumer(connection, consumer_group, topic).await?;
        Ok(Arc::new(QuirkyConsumer {
            inner,
            quirk: self.quirk,
        }))
    }
}

struct QuirkyProducer {
    inner: Arc<dyn EventProducer>,
    quirk: Quirk,
}

#[async_trait]
impl EventProducer for QuirkyProducer {
    async fn create_batch(&self) -> Result<EventBatch, HubError> {
        match self.quirk {
            Quirk::TinyBatches => Ok(EventBatch::with_max_size(8)),
            Quirk::HangingSubscriptionClose => self.inner.create_batch().await,
        }
    }

    async fn send_batch(&self, batch: EventBatch) -> Result<(), HubError> {
        self.inner.send_batch(batch).await
    }

    async fn close(&self) -> Result<(), HubError> {
        self.inner.close().await
    }
}

struct QuirkyConsumer {
    inner: Arc<dyn EventConsumer>,
    quirk: Quirk,
}

#[async_trait]
impl EventConsumer for QuirkyConsumer {
    async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, HubError> {
        let inner = self.inner.subscribe(handler, options).await?;
        match self.quirk {
            Quirk::HangingSubscriptionClose => Ok(Box::new(HangingSubscription(inner))),
            Quirk::TinyBatches => Ok(inner),
        }
    }

    async fn close(&self) -> Result<(), HubError> {
        self.inner.close().await
    }
}

struct HangingSubscription(Box<dyn Subscription>);

#[async_trait]
impl Subscription for HangingSubscription {
    fn is_running(&self) -> bool {
        self.0.is_running()
    }

    async fn close(&self) -> Result<(), HubError> {
        std::future::pending::<Result<(), HubError>>().await
    }
}

fn quirky_backend(hub: &InMemoryHub, quirk: Quirk) -> HubBackend {
    HubBackend {
        connector: Arc::new(QuirkyConnector {
            hub: hub.clone(),
            quirk,
        }),
        ..HubBackend::in_memory(hub)
    }
}

#[tokio::test]
async fn hanging_subscription_close_times_out_and_releases_the_rest() -> anyhow::Result<()> {
    let hub = InMemoryHub::new();
    let settings = RunSettings {
        teardown_timeout_ms: 200,
        ..settings()
    };
    let harness = ReproHarness::new(
        config(),
        settings,
        quirky_backend(&hub, Quirk::HangingSubscriptionClose),
    )?;

    let outcome = tokio::time::timeout(Duration::from_secs(5), harness.execute()).await?;
    assert_eq!(outcome.report.received.len(), 1);
    let failures = outcome.report.teardown_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].resource, TeardownResource::Subscription);
    assert!(failures[0].detail.contains("within 200 ms"));
    assert_eq!(outcome.result, Err(HarnessError::Teardown { failures }));

    let calls = hub.calls().await;
    assert!(calls.contains(&HubCall::CloseProducer));
    assert!(calls.contains(&HubCall::CloseConsumer));
    assert!(!calls.contains(&HubCall::CloseSubscription));
    assert!(!hub.topic_exists(TOPIC).await);
    Ok(())
}

#[tokio::test]
async fn event_over_batch_budget_is_rejected_before_sending() -> anyhow::Result<()> {
    let hub = InMemoryHub::new();
    let harness = ReproHarness::new(
        config(),
        settings(),
        quirky_backend(&hub, Quirk::TinyBatches),
    )?;

    let context = Arc::new(TestContext::with_test_id("482913", 1));
    let outcome = harness.execute_with(context).await;
    assert_eq!(
        outcome.result,
        Err(HarnessError::BatchRejected {
            test_id: "482913".into(),
        })
    );
    assert_eq!(
        outcome.report.failure.as_deref(),
        Some("event for test 482913 exceeds the batch size budget")
    );
    assert!(!hub
        .calls()
        .await
        .iter()
        .any(|call| matches!(call, HubCall::SendBatch { .. })));
    assert!(outcome.report.teardown.iter().all(|step| step.ok));
    assert!(!hub.topic_exists(TOPIC).await);
    Ok(())
}
