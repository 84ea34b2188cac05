//! Command line entry point for reproduction runs.
//!
//! `check-env` validates the environment, `run` reproduces against the live
//! event hub namespace, `simulate` drives the full harness against the
//! scripted in-memory hub, and `provision` creates or deletes the configured
//! topic through the management plane.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hub_contract::{
    ConnectionString, DeliveryFault, HubBackend, HubError, IdentityProvider, InMemoryHub,
    ServicePrincipal, TopicAdmin, TopicLocator,
};
use hub_azure::AzureHub;
use hub_http::{ArmTopicAdmin, HttpClientConfig};
use repro_harness::{ConfigError, HarnessConfig, ReproHarness, RunReport, RunSettings};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SIMULATED_CONNECTION: &str =
    "Endpoint=sb://simulated.servicebus.windows.net/;SharedAccessKeyName=simulate;SharedAccessKey=c2ltdWxhdGU=";

#[derive(Debug, Parser)]
#[command(author, version, about = "Event hub delivery reproduction runner")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the required environment variables.
    CheckEnv,
    /// Reproduce against the live event hub namespace from the environment.
    Run(RunArgs),
    /// Run the harness against the in-memory hub.
    Simulate(SimulateArgs),
    /// Create or delete the configured topic through the management plane.
    Provision(ProvisionArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Fault {
    None,
    Duplicate,
    Drop,
    ReceiveError,
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// TOML file with run settings.
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Management plane base URL.
    #[arg(long, value_name = "URL")]
    management_endpoint: Option<String>,
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    /// Delivery fault applied to the run's single send.
    #[arg(long, value_enum, default_value_t = Fault::None)]
    fault: Fault,

    /// Store the sent event only after this many milliseconds.
    #[arg(long, value_name = "MS", conflicts_with = "fault")]
    delay_ms: Option<u64>,

    /// TOML file with run settings.
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Overrides `settle_timeout_ms` from the settings.
    #[arg(long, value_name = "MS")]
    settle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Ensure,
    Delete,
}

#[derive(Debug, clap::Args)]
struct ProvisionArgs {
    #[arg(long, value_enum)]
    action: Action,

    /// TOML file with run settings; supplies partition count and retention.
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Management plane base URL.
    #[arg(long, value_name = "URL")]
    management_endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnvCheck<'a> {
    ok: bool,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    missing: &'a [&'static str],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    started_at: String,
    #[serde(flatten)]
    report: &'a RunReport,
}

#[derive(Debug, Serialize)]
struct SimulationOutput<'a> {
    started_at: String,
    fault: Fault,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay_ms: Option<u64>,
    #[serde(flatten)]
    report: &'a RunReport,
}

#[derive(Debug, Serialize)]
struct ProvisionOutput<'a> {
    action: Action,
    topic: &'a str,
    status: u16,
    ok: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    match args.command {
        Command::CheckEnv => check_env(),
        Command::Run(live) => runtime.block_on(live_run(live)),
        Command::Simulate(simulate) => runtime.block_on(simulate_run(simulate)),
        Command::Provision(provision) => runtime.block_on(provision_topic(provision)),
    }
}

fn check_env() -> Result<()> {
    let outcome = HarnessConfig::from_env();
    let (missing, error) = match &outcome {
        Ok(_) => (Vec::new(), None),
        Err(ConfigError::Missing { names }) => (names.clone(), None),
        Err(err) => (Vec::new(), Some(err.to_string())),
    };
    print_json(&EnvCheck {
        ok: outcome.is_ok(),
        missing: &missing,
        error,
    })?;
    outcome.context("environment is not ready for a reproduction run")?;
    Ok(())
}

fn load_settings(path: Option<&PathBuf>) -> Result<RunSettings> {
    match path {
        Some(path) => RunSettings::load(path)
            .with_context(|| format!("loading run settings from {}", path.display())),
        None => Ok(RunSettings::default()),
    }
}

fn simulated_config() -> Result<HarnessConfig> {
    Ok(HarnessConfig {
        principal: ServicePrincipal {
            tenant_id: "simulated-tenant".into(),
            client_id: "simulated-client".into(),
            client_secret: "simulated-secret".into(),
        },
        topic: TopicLocator {
            subscription_id: "simulated-subscription".into(),
            resource_group: "simulated-rg".into(),
            namespace: "simulated".into(),
            topic: "repro-simulated".into(),
        },
        connection: ConnectionString::parse(SIMULATED_CONNECTION)
            .context("parsing simulated connection string")?,
    })
}

fn management_config(endpoint: Option<String>) -> HttpClientConfig {
    let mut http = HttpClientConfig::default();
    if let Some(management_endpoint) = endpoint {
        http.management_endpoint = management_endpoint;
    }
    http
}

async fn live_run(args: RunArgs) -> Result<()> {
    let config = HarnessConfig::from_env().context("reading environment")?;
    let settings = load_settings(args.settings.as_ref())?;
    let http = management_config(args.management_endpoint);
    let hub = AzureHub::new(http.token_scope());
    let admin = ArmTopicAdmin::new(http).context("building management client")?;

    let started_at = humantime::format_rfc3339_millis(SystemTime::now()).to_string();
    let harness = ReproHarness::new(config, settings, hub.into_backend(Arc::new(admin)))
        .context("building reproduction harness")?;
    let outcome = harness.execute().await;
    for failure in outcome.report.teardown_failures() {
        warn!(%failure, "resource was not released");
    }
    print_json(&RunOutput {
        started_at,
        report: &outcome.report,
    })?;
    outcome.into_result().context("reproduction run failed")?;
    Ok(())
}

async fn simulate_run(args: SimulateArgs) -> Result<()> {
    let mut settings = load_settings(args.settings.as_ref())?;
    if let Some(settle_timeout_ms) = args.settle_timeout_ms {
        settings.settle_timeout_ms = settle_timeout_ms;
    }

    let hub = InMemoryHub::new();
    let fault = match (args.fault, args.delay_ms) {
        (_, Some(delay_ms)) => Some(DeliveryFault::Delay(Duration::from_millis(delay_ms))),
        (Fault::None, None) => None,
        (Fault::Duplicate, None) => Some(DeliveryFault::Duplicate),
        (Fault::Drop, None) => Some(DeliveryFault::Drop),
        (Fault::ReceiveError, None) => Some(DeliveryFault::ReceiveError(HubError::transport(
            "simulated receive failure",
        ))),
    };
    if let Some(fault) = fault {
        info!(?fault, "scripting delivery fault");
        hub.script_delivery(fault).await;
    }

    let started_at = humantime::format_rfc3339_millis(SystemTime::now()).to_string();
    let harness = ReproHarness::new(simulated_config()?, settings, HubBackend::in_memory(&hub))
        .context("building reproduction harness")?;
    let outcome = harness.execute().await;
    print_json(&SimulationOutput {
        started_at,
        fault: args.fault,
        delay_ms: args.delay_ms,
        report: &outcome.report,
    })?;
    outcome
        .into_result()
        .context("simulated reproduction run failed")?;
    Ok(())
}

async fn provision_topic(args: ProvisionArgs) -> Result<()> {
    let config = HarnessConfig::from_env().context("reading environment")?;
    let settings = load_settings(args.settings.as_ref())?;
    settings.validate().context("validating run settings")?;

    let http = management_config(args.management_endpoint);
    let identity = AzureHub::new(http.token_scope());
    let admin = ArmTopicAdmin::new(http).context("building management client")?;

    let credential = identity
        .authenticate(&config.principal)
        .await
        .context("authenticating service principal")?;
    let status = match args.action {
        Action::Ensure => admin
            .create_or_update_topic(&credential, &config.topic, &settings.topic_options())
            .await
            .with_context(|| format!("ensuring topic {}", config.topic))?,
        Action::Delete => admin
            .delete_topic(&credential, &config.topic)
            .await
            .with_context(|| format!("deleting topic {}", config.topic))?,
    };

    let ok = status.is_success();
    if ok {
        info!(topic = %config.topic, %status, "management call succeeded");
    } else {
        warn!(topic = %config.topic, %status, "management call returned non-success status");
    }
    print_json(&ProvisionOutput {
        action: args.action,
        topic: &config.topic.topic,
        status: status.0,
        ok,
    })?;
    if !ok {
        bail!("management plane returned status {status}");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value).context("serialising output")?;
    writeln!(stdout).context("writing output")?;
    Ok(())
}
