//! Tracking record written for every step execution.
//!
//! A record is inserted as `Running` before the step's collaborator is
//! invoked and rewritten with the outcome once the step ends. A record still
//! `Running` after a restart belongs to a run the process never finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::{ErrorKind, StepResult};
use crate::types::{StepName, Trigger};

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Transitions: `Running → Succeeded | Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed {
        kind: Option<ErrorKind>,
        reason: String,
    },
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunRecord {
    pub id: Uuid,
    /// Pipeline run this step belonged to; `None` for a single-step run.
    pub run_id: Option<Uuid>,
    pub trigger: Trigger,
    pub step: StepName,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl StepRunRecord {
    pub fn started(run_id: Option<Uuid>, trigger: Trigger, step: StepName) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            trigger,
            step,
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            duration_seconds: None,
            updated_at: now,
        }
    }

    /// Apply a finished step's outcome. `started_at` is left unchanged
    /// because it is part of the storage key.
    pub fn finish(&mut self, result: &StepResult) {
        self.status = match &result.error {
            None => RunStatus::Succeeded,
            Some(e) => RunStatus::Failed {
                kind: Some(e.kind),
                reason: e.message.clone(),
            },
        };
        self.ended_at = Some(result.ended_at);
        self.duration_seconds = Some(result.duration_seconds());
        self.updated_at = Utc::now();
    }
}
