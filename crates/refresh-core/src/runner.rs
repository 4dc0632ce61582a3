//! Runs one step under a failure boundary and normalizes the outcome.
//!
//! The boundary contains three ways a collaborator can go wrong: it returns
//! a `StepError`, it panics, or it runs past the configured maximum step
//! duration. All three become a failed `StepResult`; none of them reach the
//! caller's control flow.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{info, warn};

use crate::step::{Step, StepError, StepOutcome, StepResult};
use crate::types::StepName;

#[derive(Debug, Clone, Default)]
pub struct StepRunner {
    max_step_duration: Option<Duration>,
}

impl StepRunner {
    pub fn new(max_step_duration: Option<Duration>) -> Self {
        Self { max_step_duration }
    }

    pub fn max_step_duration(&self) -> Option<Duration> {
        self.max_step_duration
    }

    /// Run a registered step.
    pub async fn run_step(&self, step: &dyn Step) -> StepResult {
        self.run(step.name(), step.run()).await
    }

    /// Await `work` as step `name`. Always returns exactly one result.
    pub async fn run<F>(&self, name: StepName, work: F) -> StepResult
    where
        F: Future<Output = StepOutcome>,
    {
        let started_at = Utc::now();
        info!(step = %name, "step started");

        let guarded = AssertUnwindSafe(work).catch_unwind();
        let outcome = match self.max_step_duration {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => flatten_panic(caught),
                Err(_) => Err(StepError::timeout(format!(
                    "step exceeded {}s",
                    limit.as_secs()
                ))),
            },
            None => flatten_panic(guarded.await),
        };

        let result = StepResult::from_outcome(name, started_at, Utc::now(), outcome);
        match &result.error {
            None => info!(
                step = %name,
                duration_secs = result.duration_seconds(),
                "step succeeded"
            ),
            Some(e) => warn!(
                step = %name,
                kind = %e.kind,
                error = %e.message,
                duration_secs = result.duration_seconds(),
                "step failed, continuing"
            ),
        }
        result
    }
}

fn flatten_panic(caught: Result<StepOutcome, Box<dyn Any + Send>>) -> StepOutcome {
    caught.unwrap_or_else(|panic| {
        Err(StepError::data(format!(
            "step panicked: {}",
            panic_message(&panic)
        )))
    })
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
