use std::sync::Arc;

use crate::error::{RefreshError, Result};
use crate::step::Step;
use crate::types::StepName;

/// The ordered data steps a pipeline run executes.
///
/// Construction fails unless the steps are exactly balance-update,
/// deals-update, universe-update, weights-update in that order. Notification
/// is dispatched by the orchestrator and is never registered here.
pub struct StepRegistry {
    steps: Vec<Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Result<Self> {
        if steps.is_empty() {
            return Err(RefreshError::InvalidRegistry("no steps registered".into()));
        }
        let names: Vec<StepName> = steps.iter().map(|s| s.name()).collect();
        if names.contains(&StepName::Notification) {
            return Err(RefreshError::InvalidRegistry(
                "notification runs after the data steps and cannot be registered".into(),
            ));
        }
        if names != StepName::data_steps() {
            let got: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
            let want: Vec<&str> = StepName::data_steps().iter().map(|n| n.as_str()).collect();
            return Err(RefreshError::InvalidRegistry(format!(
                "expected [{}], got [{}]",
                want.join(", "),
                got.join(", ")
            )));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn get(&self, name: StepName) -> Option<&Arc<dyn Step>> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<StepName> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}
