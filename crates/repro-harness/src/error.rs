use hub_contract::{HubError, ManagementStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::harness::Phase;
use crate::report::TeardownResource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing or empty environment variables: {}", names.join(", "))]
    Missing { names: Vec<&'static str> },
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("invalid run settings: {0}")]
    Settings(String),
}

/// First failed assertion of the verification step.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationFailure {
    #[error("expected {expected} received event(s), got {actual}")]
    ReceivedCount { expected: usize, actual: usize },
    #[error("received test_id {actual:?}, expected {expected:?}")]
    CorrelationMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("{count} handler error(s) recorded, first: {first}")]
    HandlerErrors { count: usize, first: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{resource}: {detail}")]
pub struct TeardownFailure {
    pub resource: TeardownResource,
    pub detail: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: HubError,
    },
    #[error("{phase} returned non-success status {status}")]
    ManagementStatus {
        phase: Phase,
        status: ManagementStatus,
    },
    #[error("event for test {test_id} exceeds the batch size budget")]
    BatchRejected { test_id: String },
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationFailure),
    #[error("teardown failed: {}", failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Teardown { failures: Vec<TeardownFailure> },
}
