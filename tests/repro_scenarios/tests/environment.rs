use std::collections::HashMap;

use hub_contract::{HubBackend, InMemoryHub};
use repro_harness::{ConfigError, HarnessConfig, HarnessEnv, ReproHarness, RunSettings};

fn environment() -> HashMap<&'static str, String> {
    HashMap::from([
        (HarnessEnv::TenantId.as_str(), "tenant-a".to_string()),
        (HarnessEnv::ResourceGroup.as_str(), "rg-a".to_string()),
        (HarnessEnv::SubscriptionId.as_str(), "sub-a".to_string()),
        (HarnessEnv::ClientId.as_str(), "client-a".to_string()),
        (HarnessEnv::ClientSecret.as_str(), "secret-a".to_string()),
        (HarnessEnv::Namespace.as_str(), "ns-a".to_string()),
        (HarnessEnv::TopicName.as_str(), "repro-env".to_string()),
        (
            HarnessEnv::ConnectionString.as_str(),
            "Endpoint=sb://ns-a.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=a2V5"
                .to_string(),
        ),
    ])
}

#[tokio::test]
async fn environment_and_settings_file_drive_a_full_run() -> anyhow::Result<()> {
    let env = environment();
    let config = HarnessConfig::from_lookup(|name| env.get(name).cloned())?;
    let settings = RunSettings::from_toml_str(
        r#"
        settle_timeout_ms = 2000
        linger_ms = 50
        max_wait_ms = 20
        partition_count = 2
        "#,
    )?;

    let hub = InMemoryHub::new();
    hub.accept_only(config.principal.clone()).await;
    let report = ReproHarness::new(config, settings, HubBackend::in_memory(&hub))?
        .run()
        .await?;

    assert_eq!(report.topic, "repro-env");
    assert_eq!(report.received.len(), 1);
    assert!(!hub.topic_exists("repro-env").await);
    Ok(())
}

#[test]
fn every_missing_variable_is_named_before_anything_runs() {
    let mut env = environment();
    env.remove(HarnessEnv::ClientSecret.as_str());
    env.insert(HarnessEnv::Namespace.as_str(), "   ".to_string());

    let err = HarnessConfig::from_lookup(|name| env.get(name).cloned())
        .expect_err("incomplete environment");
    assert_eq!(
        err,
        ConfigError::Missing {
            names: vec!["AZURE_CLIENT_SECRET", "EVENTHUB_NAMESPACE"],
        }
    );
}

#[test]
fn malformed_connection_string_is_attributed_to_its_variable() {
    let mut env = environment();
    env.insert(
        HarnessEnv::ConnectionString.as_str(),
        "SharedAccessKeyName=send".to_string(),
    );

    match HarnessConfig::from_lookup(|name| env.get(name).cloned()) {
        Err(ConfigError::Invalid { name, .. }) => assert_eq!(name, "EVENTHUB_CONNECTION_STRING"),
        other => panic!("unexpected result: {other:?}"),
    }
}
