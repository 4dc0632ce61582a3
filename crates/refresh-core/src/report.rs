//! Aggregate outcome of one pipeline execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::step::{StepError, StepResult};
use crate::types::{StepName, Trigger};

// ---------------------------------------------------------------------------
// PipelineReport
// ---------------------------------------------------------------------------

/// Results of every step attempted in one run, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub steps: Vec<StepResult>,
}

impl PipelineReport {
    /// Start an empty report. `ended_at` tracks the latest appended result
    /// until `finish` seals it.
    pub fn begin(trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            started_at: now,
            ended_at: now,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, result: StepResult) {
        self.ended_at = self.ended_at.max(result.ended_at);
        self.steps.push(result);
    }

    pub fn finish(mut self) -> Self {
        self.ended_at = self.ended_at.max(Utc::now());
        self
    }

    /// True iff every attempted step succeeded.
    pub fn overall_success(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }

    /// Success of the data steps alone, ignoring the notification outcome.
    pub fn data_success(&self) -> bool {
        self.steps
            .iter()
            .filter(|s| s.name.is_data_step())
            .all(|s| s.success)
    }

    pub fn total_duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.total_duration().num_milliseconds() as f64 / 1000.0
    }

    pub fn successful_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.success).count()
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.success)
    }

    pub fn step(&self, name: StepName) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn view(&self) -> ReportView {
        ReportView::from(self)
    }
}

// ---------------------------------------------------------------------------
// ReportView: shape returned by the operator control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportView {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_duration: f64,
    #[serde(
        serialize_with = "serialize_steps",
        deserialize_with = "deserialize_steps"
    )]
    pub steps: Vec<(StepName, StepView)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub success: bool,
    pub duration_seconds: f64,
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// One step run on its own, as returned by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleStepView {
    pub step: StepName,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<StepError>,
}

impl From<&StepResult> for SingleStepView {
    fn from(r: &StepResult) -> Self {
        Self {
            step: r.name,
            success: r.success,
            started_at: r.started_at,
            ended_at: r.ended_at,
            duration_seconds: r.duration_seconds(),
            result: r.payload.clone(),
            error: r.error.clone(),
        }
    }
}

impl From<&StepResult> for StepView {
    fn from(r: &StepResult) -> Self {
        Self {
            success: r.success,
            duration_seconds: r.duration_seconds(),
            result: r.payload.clone(),
            error: r.error.clone(),
        }
    }
}

impl From<&PipelineReport> for ReportView {
    fn from(report: &PipelineReport) -> Self {
        Self {
            run_id: report.run_id,
            trigger: report.trigger,
            success: report.overall_success(),
            start_time: report.started_at,
            end_time: report.ended_at,
            total_duration: report.total_duration_seconds(),
            steps: report
                .steps
                .iter()
                .map(|s| (s.name, StepView::from(s)))
                .collect(),
        }
    }
}

/// Serialize steps as a JSON object keyed by step name, keeping run order.
fn serialize_steps<S>(steps: &[(StepName, StepView)], s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = s.serialize_map(Some(steps.len()))?;
    for (name, view) in steps {
        map.serialize_entry(name.as_str(), view)?;
    }
    map.end()
}

/// Inverse of `serialize_steps`; entry order is run order.
fn deserialize_steps<'de, D>(d: D) -> Result<Vec<(StepName, StepView)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StepsVisitor;

    impl<'de> Visitor<'de> for StepsVisitor {
        type Value = Vec<(StepName, StepView)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of step name to step result")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut steps = Vec::with_capacity(map.size_hint().unwrap_or(5));
            while let Some((key, view)) = map.next_entry::<String, StepView>()? {
                let name: StepName = key.parse().map_err(de::Error::custom)?;
                steps.push((name, view));
            }
            Ok(steps)
        }
    }

    d.deserialize_map(StepsVisitor)
}
