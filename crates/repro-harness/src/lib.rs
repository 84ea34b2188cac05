//! Bug reproduction harness for event hub delivery.
//!
//! A run authenticates, ensures a topic, subscribes from the latest position,
//! sends one event tagged with a random `test_id`, waits for it to arrive, and
//! verifies that exactly that event (and no handler error) was observed. The
//! topic and every client are released afterwards whatever the outcome.

pub mod config;
pub mod context;
pub mod error;
pub mod harness;
pub mod report;

pub use config::{HarnessConfig, HarnessEnv, RunSettings};
pub use context::{RecordingHandler, TestContext};
pub use error::{ConfigError, HarnessError, TeardownFailure, VerificationFailure};
pub use harness::{Phase, ReproHarness};
pub use report::{PhaseTiming, RunOutcome, RunReport, TeardownResource, TeardownStep};
