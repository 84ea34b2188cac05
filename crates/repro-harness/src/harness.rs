//! Phase sequencing for a single reproduction run.
//!
//! Forward phases are fail-fast. Teardown always runs afterwards and releases
//! every resource that was acquired, exactly once, each independently of the
//! others.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hub_contract::{
    Credential, EventConsumer, EventProducer, HubBackend, HubError, Subscription,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::config::{HarnessConfig, RunSettings};
use crate::context::{RecordingHandler, TestContext};
use crate::error::HarnessError;
use crate::report::{
    failed_steps, PhaseTiming, RunOutcome, RunReport, TeardownResource, TeardownStep,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Authenticate,
    EnsureTopic,
    ConnectClients,
    Subscribe,
    Send,
    AwaitDelivery,
    Verify,
    Teardown,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::EnsureTopic => "ensure_topic",
            Self::ConnectClients => "connect_clients",
            Self::Subscribe => "subscribe",
            Self::Send => "send",
            Self::AwaitDelivery => "await_delivery",
            Self::Verify => "verify",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles acquired by the forward phases, released by teardown.
#[derive(Default)]
struct Resources {
    credential: Option<Credential>,
    topic_ensured: bool,
    consumer: Option<Arc<dyn EventConsumer>>,
    producer: Option<Arc<dyn EventProducer>>,
    subscription: Option<Box<dyn Subscription>>,
}

#[derive(Debug, Clone)]
pub struct ReproHarness {
    config: HarnessConfig,
    settings: RunSettings,
    backend: HubBackend,
}

impl ReproHarness {
    pub fn new(
        config: HarnessConfig,
        settings: RunSettings,
        backend: HubBackend,
    ) -> Result<Self, HarnessError> {
        settings.validate()?;
        Ok(Self {
            config,
            settings,
            backend,
        })
    }

    #[must_use]
    pub const fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run with a fresh random test id.
    pub async fn run(&self) -> Result<RunReport, HarnessError> {
        self.execute().await.into_result()
    }

    pub async fn execute(&self) -> RunOutcome {
        let context = Arc::new(TestContext::new(self.settings.expected_events));
        self.execute_with(context).await
    }

    /// Run against a caller-supplied context; the report is produced even on failure.
    pub async fn execute_with(&self, context: Arc<TestContext>) -> RunOutcome {
        let span = info_span!(
            "repro",
            test_id = %context.test_id(),
            topic = %self.config.topic
        );
        async {
            let mut resources = Resources::default();
            let mut phases = Vec::new();
            let forward = self.forward(&context, &mut resources, &mut phases).await;
            let teardown = self.teardown(&mut resources, &mut phases).await;

            let failures = failed_steps(&teardown);
            let result = match forward {
                Err(err) => Err(err),
                Ok(()) if failures.is_empty() => Ok(()),
                Ok(()) => Err(HarnessError::Teardown { failures }),
            };
            match &result {
                Ok(()) => info!("reproduction run passed"),
                Err(err) => warn!(%err, "reproduction run failed"),
            }

            let report = RunReport {
                test_id: context.test_id().to_string(),
                topic: self.config.topic.topic.clone(),
                passed: result.is_ok(),
                failure: result.as_ref().err().map(ToString::to_string),
                received: context.received().await,
                errors: context.errors().await,
                phases,
                teardown,
            };
            RunOutcome { report, result }
        }
        .instrument(span)
        .await
    }

    async fn forward(
        &self,
        context: &Arc<TestContext>,
        resources: &mut Resources,
        phases: &mut Vec<PhaseTiming>,
    ) -> Result<(), HarnessError> {
        let backend = &self.backend;
        let topic = &self.config.topic;
        let connection = &self.config.connection;

        let credential = timed(
            Phase::Authenticate,
            phases,
            backend.identity.authenticate(&self.config.principal),
        )
        .await?;
        resources.credential = Some(credential.clone());

        let options = self.settings.topic_options();
        let status = timed(
            Phase::EnsureTopic,
            phases,
            backend
                .admin
                .create_or_update_topic(&credential, topic, &options),
        )
        .await?;
        if !status.is_success() {
            return Err(HarnessError::ManagementStatus {
                phase: Phase::EnsureTopic,
                status,
            });
        }
        resources.topic_ensured = true;

        let consumer = timed(
            Phase::ConnectClients,
            phases,
            backend
                .connector
                .consumer(connection, &self.settings.consumer_group, &topic.topic),
        )
        .await?;
        resources.consumer = Some(consumer.clone());
        let producer = timed(
            Phase::ConnectClients,
            phases,
            backend.connector.producer(connection, &topic.topic),
        )
        .await?;
        resources.producer = Some(producer.clone());

        let handler = Arc::new(RecordingHandler::new(context.clone()));
        let subscription = timed(
            Phase::Subscribe,
            phases,
            consumer.subscribe(handler, self.settings.subscribe_options()),
        )
        .await?;
        resources.subscription = Some(subscription);

        let mut batch = timed(Phase::Send, phases, producer.create_batch()).await?;
        if !batch.try_add(context.message()) {
            return Err(HarnessError::BatchRejected {
                test_id: context.test_id().to_string(),
            });
        }
        timed(Phase::Send, phases, producer.send_batch(batch)).await?;

        let started = Instant::now();
        let completed = context
            .wait_for_expected(self.settings.settle_timeout())
            .await;
        if completed && !self.settings.linger().is_zero() {
            tokio::time::sleep(self.settings.linger()).await;
        }
        let elapsed_ms = millis_since(started);
        if completed {
            info!(phase = %Phase::AwaitDelivery, elapsed_ms, "expected events arrived");
        } else {
            warn!(
                phase = %Phase::AwaitDelivery,
                elapsed_ms,
                "settle timeout elapsed before expected events arrived"
            );
        }
        phases.push(PhaseTiming {
            phase: Phase::AwaitDelivery,
            elapsed_ms,
            ok: completed,
        });

        let started = Instant::now();
        let verified = context.verify().await;
        phases.push(PhaseTiming {
            phase: Phase::Verify,
            elapsed_ms: millis_since(started),
            ok: verified.is_ok(),
        });
        verified?;
        Ok(())
    }

    async fn teardown(
        &self,
        resources: &mut Resources,
        phases: &mut Vec<PhaseTiming>,
    ) -> Vec<TeardownStep> {
        let started = Instant::now();
        let mut steps = Vec::new();

        let limit = self.settings.teardown_timeout();
        if let Some(subscription) = resources.subscription.take() {
            steps.push(
                release(TeardownResource::Subscription, limit, async {
                    subscription.close().await.map_err(|err| err.to_string())
                })
                .await,
            );
        }
        if let Some(producer) = resources.producer.take() {
            steps.push(
                release(TeardownResource::Producer, limit, async {
                    producer.close().await.map_err(|err| err.to_string())
                })
                .await,
            );
        }
        if let Some(consumer) = resources.consumer.take() {
            steps.push(
                release(TeardownResource::Consumer, limit, async {
                    consumer.close().await.map_err(|err| err.to_string())
                })
                .await,
            );
        }
        if std::mem::take(&mut resources.topic_ensured) {
            if let Some(credential) = resources.credential.as_ref() {
                let admin = &self.backend.admin;
                let topic = &self.config.topic;
                steps.push(
                    release(TeardownResource::Topic, limit, async {
                        match admin.delete_topic(credential, topic).await {
                            Ok(status) if status.is_success() => Ok(()),
                            Ok(status) => {
                                Err(format!("delete returned non-success status {status}"))
                            }
                            Err(err) => Err(err.to_string()),
                        }
                    })
                    .await,
                );
            }
        }

        for failed in steps.iter().filter(|step| !step.ok) {
            warn!(
                resource = %failed.resource,
                detail = failed.detail.as_deref().unwrap_or_default(),
                "teardown step failed"
            );
        }
        phases.push(PhaseTiming {
            phase: Phase::Teardown,
            elapsed_ms: millis_since(started),
            ok: steps.iter().all(|step| step.ok),
        });
        steps
    }
}

/// Await one release, bounded by `limit`; a release that overruns counts as failed.
async fn release<F>(resource: TeardownResource, limit: Duration, operation: F) -> TeardownStep
where
    F: Future<Output = Result<(), String>>,
{
    let outcome = match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(format!(
            "release did not complete within {} ms",
            limit.as_millis()
        )),
    };
    TeardownStep {
        resource,
        ok: outcome.is_ok(),
        detail: outcome.err(),
    }
}

fn millis_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn timed<T, F>(
    phase: Phase,
    phases: &mut Vec<PhaseTiming>,
    operation: F,
) -> Result<T, HarnessError>
where
    F: Future<Output = Result<T, HubError>>,
{
    let started = Instant::now();
    let result = operation
        .instrument(info_span!("phase", phase = %phase))
        .await;
    let elapsed_ms = millis_since(started);
    phases.push(PhaseTiming {
        phase,
        elapsed_ms,
        ok: result.is_ok(),
    });
    match result {
        Ok(value) => {
            info!(%phase, elapsed_ms, "phase complete");
            Ok(value)
        }
        Err(source) => {
            warn!(%phase, elapsed_ms, error = %source, "phase failed");
            Err(HarnessError::Phase { phase, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_contract::{
        CloseTarget, ConnectionString, DeliveryFault, HubCall, InMemoryHub, ManagementStatus,
        ServicePrincipal, TopicLocator,
    };

    fn config() -> HarnessConfig {
        HarnessConfig {
            principal: ServicePrincipal {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            },
            topic: TopicLocator {
                subscription_id: "sub".into(),
                resource_group: "rg".into(),
                namespace: "ns".into(),
                topic: "repro-topic".into(),
            },
            connection: ConnectionString::parse(
                "Endpoint=sb://ns.example/;SharedAccessKeyName=k;SharedAccessKey=v",
            )
            .expect("valid connection string"),
        }
    }

    fn fast_settings() -> RunSettings {
        RunSettings {
            settle_timeout_ms: 2_000,
            linger_ms: 50,
            max_wait_ms: 20,
            ..RunSettings::default()
        }
    }

    fn harness(hub: &InMemoryHub, settings: RunSettings) -> ReproHarness {
        ReproHarness::new(config(), settings, HubBackend::in_memory(hub)).expect("valid settings")
    }

    #[tokio::test]
    async fn clean_run_receives_one_event_and_tears_down() {
        let hub = InMemoryHub::new();
        let report = harness(&hub, fast_settings()).run().await.expect("run passes");

        assert!(report.passed);
        assert_eq!(report.received.len(), 1);
        assert_eq!(report.received[0].body["test_id"], report.test_id.as_str());
        assert!(report.errors.is_empty());
        assert!(report.teardown.iter().all(|step| step.ok));
        assert_eq!(report.teardown.len(), 4);
        assert!(!hub.topic_exists("repro-topic").await);

        let calls = hub.calls().await;
        let closes: Vec<&HubCall> = calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    HubCall::CloseSubscription | HubCall::CloseProducer | HubCall::CloseConsumer
                )
            })
            .collect();
        assert_eq!(
            closes,
            vec![
                &HubCall::CloseSubscription,
                &HubCall::CloseProducer,
                &HubCall::CloseConsumer
            ]
        );
        assert!(calls
            .iter()
            .any(|call| matches!(call, HubCall::Checkpoint { offset: 0, .. })));
    }

    #[tokio::test]
    async fn rejected_principal_fails_before_topic_creation() {
        let hub = InMemoryHub::new();
        hub.accept_only(ServicePrincipal {
            tenant_id: "tenant".into(),
            client_id: "client".into(),
            client_secret: "other".into(),
        })
        .await;

        let outcome = harness(&hub, fast_settings()).execute().await;
        assert!(matches!(
            outcome.result,
            Err(HarnessError::Phase {
                phase: Phase::Authenticate,
                source: HubError::Unauthorized { .. }
            })
        ));
        assert!(outcome.report.teardown.is_empty());
        assert!(!hub
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, HubCall::CreateOrUpdateTopic { .. })));
    }

    #[tokio::test]
    async fn non_success_ensure_status_aborts_without_deleting() {
        let hub = InMemoryHub::new();
        hub.script_admin_status(ManagementStatus(409)).await;

        let outcome = harness(&hub, fast_settings()).execute().await;
        assert_eq!(
            outcome.result,
            Err(HarnessError::ManagementStatus {
                phase: Phase::EnsureTopic,
                status: ManagementStatus(409),
            })
        );
        assert!(!hub
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, HubCall::DeleteTopic { .. })));
    }

    #[tokio::test]
    async fn dropped_delivery_fails_verification_and_still_deletes_topic() {
        let hub = InMemoryHub::new();
        hub.script_delivery(DeliveryFault::Drop).await;
        let settings = RunSettings {
            settle_timeout_ms: 100,
            ..fast_settings()
        };

        let outcome = harness(&hub, settings).execute().await;
        assert_eq!(
            outcome.result,
            Err(HarnessError::Verification(
                crate::error::VerificationFailure::ReceivedCount {
                    expected: 1,
                    actual: 0
                }
            ))
        );
        assert!(!hub.topic_exists("repro-topic").await);
        assert!(outcome
            .report
            .phases
            .iter()
            .any(|timing| timing.phase == Phase::AwaitDelivery && !timing.ok));
    }

    #[tokio::test]
    async fn failing_subscription_close_does_not_block_other_releases() {
        let hub = InMemoryHub::new();
        hub.fail_next_close(CloseTarget::Subscription).await;

        let outcome = harness(&hub, fast_settings()).execute().await;
        match outcome.result {
            Err(HarnessError::Teardown { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].resource, TeardownResource::Subscription);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let calls = hub.calls().await;
        assert!(calls.contains(&HubCall::CloseProducer));
        assert!(calls.contains(&HubCall::CloseConsumer));
        assert!(!hub.topic_exists("repro-topic").await);
    }

    #[tokio::test]
    async fn delayed_delivery_within_timeout_passes() {
        let hub = InMemoryHub::new();
        hub.script_delivery(DeliveryFault::Delay(Duration::from_millis(100)))
            .await;
        let report = harness(&hub, fast_settings()).run().await.expect("run passes");
        assert_eq!(report.received.len(), 1);
    }

    #[test]
    fn invalid_settings_are_rejected_up_front() {
        let hub = InMemoryHub::new();
        let settings = RunSettings {
            expected_events: 3,
            ..RunSettings::default()
        };
        let err = ReproHarness::new(config(), settings, HubBackend::in_memory(&hub))
            .expect_err("invalid settings");
        assert!(matches!(err, HarnessError::Config(_)));
    }
}
