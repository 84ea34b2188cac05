//! Serializable record of a reproduction run.

use std::fmt;

use hub_contract::{HubError, ReceivedEvent};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, TeardownFailure};
use crate::harness::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownResource {
    Subscription,
    Producer,
    Consumer,
    Topic,
}

impl fmt::Display for TeardownResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Subscription => "subscription",
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::Topic => "topic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownStep {
    pub resource: TeardownResource,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub elapsed_ms: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub test_id: String,
    pub topic: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub received: Vec<ReceivedEvent>,
    pub errors: Vec<HubError>,
    pub phases: Vec<PhaseTiming>,
    pub teardown: Vec<TeardownStep>,
}

impl RunReport {
    /// Teardown steps that did not complete cleanly.
    #[must_use]
    pub fn teardown_failures(&self) -> Vec<TeardownFailure> {
        failed_steps(&self.teardown)
    }
}

pub(crate) fn failed_steps(steps: &[TeardownStep]) -> Vec<TeardownFailure> {
    steps
        .iter()
        .filter(|step| !step.ok)
        .map(|step| TeardownFailure {
            resource: step.resource,
            detail: step.detail.clone().unwrap_or_default(),
        })
        .collect()
}

/// Report plus the typed result of the run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub result: Result<(), HarnessError>,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<RunReport, HarnessError> {
        self.result.map(|()| self.report)
    }
}
