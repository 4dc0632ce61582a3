//! Step data model: the collaborator seam and the uniform outcome record.
//!
//! A `Step` is a zero-argument async collaborator that performs one update
//! and yields a `StepOutcome`: either a JSON payload or a classified
//! `StepError`. The orchestrator never looks inside the payload; it only
//! forwards it to the notification formatter and the control surface.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StepName;

// ---------------------------------------------------------------------------
// ErrorKind / StepError
// ---------------------------------------------------------------------------

/// Classification of a step-local failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or upstream API unreachable.
    Transport,
    /// Credentials or session rejected by the broker.
    Auth,
    /// Malformed or missing upstream data.
    Data,
    /// Writing to the local store failed.
    Persistence,
    /// The step exceeded its allotted duration.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Auth => "auth",
            ErrorKind::Data => "data",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

/// What a step collaborator yields.
pub type StepOutcome = Result<serde_json::Value, StepError>;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A named, independently-fallible unit of the pipeline.
pub trait Step: Send + Sync {
    fn name(&self) -> StepName;
    fn run(&self) -> BoxFuture<'_, StepOutcome>;
}

/// Adapts a closure returning a future into a `Step`.
pub struct FnStep<F> {
    name: StepName,
    f: F,
}

impl<F, Fut> FnStep<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = StepOutcome> + Send + 'static,
{
    pub fn new(name: StepName, f: F) -> Self {
        Self { name, f }
    }
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = StepOutcome> + Send + 'static,
{
    fn name(&self) -> StepName {
        self.name
    }

    fn run(&self) -> BoxFuture<'_, StepOutcome> {
        Box::pin((self.f)())
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome record of one step execution attempt.
///
/// `error` is set iff `success` is false, and `ended_at` is never earlier
/// than `started_at`. Both hold by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: StepName,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn from_outcome(
        name: StepName,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: StepOutcome,
    ) -> Self {
        // Wall clocks can step backwards between the two readings.
        let ended_at = ended_at.max(started_at);
        match outcome {
            Ok(payload) => Self {
                name,
                success: true,
                started_at,
                ended_at,
                payload: Some(payload),
                error: None,
            },
            Err(error) => Self {
                name,
                success: false,
                started_at,
                ended_at,
                payload: None,
                error: Some(error),
            },
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as CDur;

    #[test]
    fn success_outcome_carries_payload_and_no_error() {
        let start = Utc::now();
        let result = StepResult::from_outcome(
            StepName::BalanceUpdate,
            start,
            start + CDur::milliseconds(1500),
            Ok(serde_json::json!({ "updated_accounts": 4 })),
        );
        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.payload.unwrap()["updated_accounts"], 4);
    }

    #[test]
    fn failure_outcome_carries_error_kind() {
        let start = Utc::now();
        let result = StepResult::from_outcome(
            StepName::DealsUpdate,
            start,
            start + CDur::seconds(2),
            Err(StepError::auth("session expired")),
        );
        assert!(!result.success);
        assert!(result.payload.is_none());
        assert_eq!(result.error_kind(), Some(ErrorKind::Auth));
        assert_eq!(result.duration_seconds(), 2.0);
    }

    #[test]
    fn duration_is_never_negative() {
        let start = Utc::now();
        let result = StepResult::from_outcome(
            StepName::UniverseUpdate,
            start,
            start - CDur::seconds(5),
            Ok(serde_json::Value::Null),
        );
        assert_eq!(result.ended_at, result.started_at);
        assert_eq!(result.duration(), CDur::zero());
    }

    #[test]
    fn step_error_displays_kind_and_message() {
        let e = StepError::persistence("disk full");
        assert_eq!(e.to_string(), "persistence: disk full");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "persistence");
    }

    #[tokio::test]
    async fn fn_step_invokes_closure() {
        let step = FnStep::new(StepName::WeightsUpdate, || async {
            Ok(serde_json::json!({ "updated_weights": 20 }))
        });
        assert_eq!(step.name(), StepName::WeightsUpdate);
        let value = step.run().await.unwrap();
        assert_eq!(value["updated_weights"], 20);
    }
}
