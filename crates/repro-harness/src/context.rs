//! Per-run test context and the handler that feeds it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hub_contract::{EventData, EventHandler, HubError, PartitionContext, ReceivedEvent};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::VerificationFailure;

/// Correlation id, accumulators, and the completion signal for one run.
#[derive(Debug)]
pub struct TestContext {
    test_id: String,
    expected: usize,
    received: Mutex<Vec<ReceivedEvent>>,
    errors: Mutex<Vec<HubError>>,
    progress: watch::Sender<usize>,
}

impl TestContext {
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self::with_test_id(Self::generate_test_id(), expected)
    }

    #[must_use]
    pub fn with_test_id(test_id: impl Into<String>, expected: usize) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            test_id: test_id.into(),
            expected,
            received: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            progress,
        }
    }

    /// Six-digit random correlation id.
    #[must_use]
    pub fn generate_test_id() -> String {
        rand::thread_rng().gen_range(100_000..1_000_000).to_string()
    }

    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    #[must_use]
    pub const fn expected(&self) -> usize {
        self.expected
    }

    /// The tagged message this run sends.
    #[must_use]
    pub fn message(&self) -> EventData {
        EventData::new(json!({ "test_id": self.test_id })).with_property("test_id", &self.test_id)
    }

    pub async fn record_event(&self, event: ReceivedEvent) {
        let count = {
            let mut received = self.received.lock().await;
            received.push(event);
            received.len()
        };
        self.progress.send_replace(count);
    }

    pub async fn record_error(&self, error: HubError) {
        self.errors.lock().await.push(error);
    }

    pub async fn received(&self) -> Vec<ReceivedEvent> {
        self.received.lock().await.clone()
    }

    pub async fn errors(&self) -> Vec<HubError> {
        self.errors.lock().await.clone()
    }

    /// Wait until the expected number of events arrived; `false` on timeout.
    pub async fn wait_for_expected(&self, timeout: Duration) -> bool {
        let mut progress = self.progress.subscribe();
        let expected = self.expected;
        let outcome = tokio::time::timeout(timeout, progress.wait_for(|count| *count >= expected)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    /// Checks, in order: received count, correlation id, handler errors.
    pub async fn verify(&self) -> Result<(), VerificationFailure> {
        let received = self.received().await;
        if received.len() != self.expected {
            return Err(VerificationFailure::ReceivedCount {
                expected: self.expected,
                actual: received.len(),
            });
        }
        for event in &received {
            let actual = event
                .body
                .get("test_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            if actual.as_deref() != Some(self.test_id.as_str()) {
                return Err(VerificationFailure::CorrelationMismatch {
                    expected: self.test_id.clone(),
                    actual,
                });
            }
        }
        let errors = self.errors().await;
        if let Some(first) = errors.first() {
            return Err(VerificationFailure::HandlerErrors {
                count: errors.len(),
                first: first.to_string(),
            });
        }
        Ok(())
    }
}

/// Handler pair that checkpoints and records deliveries into a [`TestContext`].
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    context: Arc<TestContext>,
}

impl RecordingHandler {
    #[must_use]
    pub const fn new(context: Arc<TestContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn process_events(
        &self,
        events: Vec<ReceivedEvent>,
        partition: &PartitionContext,
    ) -> Result<(), HubError> {
        if events.len() > self.context.expected() {
            return Err(HubError::unexpected(format!(
                "partition {} delivered a batch of {} events, expected at most {}",
                partition.partition_id,
                events.len(),
                self.context.expected()
            )));
        }
        for event in events {
            partition.update_checkpoint(&event).await?;
            debug!(
                partition = %partition.partition_id,
                offset = event.offset,
                "event received"
            );
            self.context.record_event(event).await;
        }
        Ok(())
    }

    async fn process_error(&self, error: HubError, partition: Option<&PartitionContext>) {
        warn!(
            partition = partition.map(|p| p.partition_id.as_str()),
            %error,
            "handler error"
        );
        self.context.record_error(error).await;
    }
}
