//! Runs against a real event hub namespace. Needs the eight `AZURE_*` /
//! `EVENTHUB_*` variables and a principal allowed to manage and use the topic:
//!
//! `cargo test -p repro-scenario-tests --test live -- --ignored`

use std::sync::Arc;

use hub_azure::AzureHub;
use hub_http::{ArmTopicAdmin, HttpClientConfig};
use repro_harness::{HarnessConfig, ReproHarness, RunSettings};

#[tokio::test]
#[ignore = "needs a live event hub namespace and service principal"]
async fn live_namespace_delivers_the_event_once() -> anyhow::Result<()> {
    let config = HarnessConfig::from_env()?;
    let http = HttpClientConfig::default();
    let hub = AzureHub::new(http.token_scope());
    let admin = ArmTopicAdmin::new(http)?;
    let harness = ReproHarness::new(
        config,
        RunSettings::default(),
        hub.into_backend(Arc::new(admin)),
    )?;

    let outcome = harness.execute().await;
    let report = &outcome.report;
    assert!(report.teardown_failures().is_empty(), "{:?}", report.teardown);
    assert_eq!(report.received.len(), 1, "{:?}", report.errors);
    assert_eq!(report.received[0].body["test_id"], report.test_id.as_str());
    outcome.into_result()?;
    Ok(())
}
