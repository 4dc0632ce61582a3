use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// StepName
// ---------------------------------------------------------------------------

/// The fixed set of pipeline steps.
///
/// Declaration order is execution order: `WeightsUpdate` reads the investable
/// set refreshed by `UniverseUpdate`, and `Notification` always runs last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    BalanceUpdate,
    DealsUpdate,
    UniverseUpdate,
    WeightsUpdate,
    Notification,
}

impl StepName {
    pub fn all() -> &'static [StepName] {
        &[
            StepName::BalanceUpdate,
            StepName::DealsUpdate,
            StepName::UniverseUpdate,
            StepName::WeightsUpdate,
            StepName::Notification,
        ]
    }

    /// Data steps in execution order. Excludes the trailing notification.
    pub fn data_steps() -> &'static [StepName] {
        &StepName::all()[..4]
    }

    pub fn is_data_step(self) -> bool {
        self != StepName::Notification
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::BalanceUpdate => "balance-update",
            StepName::DealsUpdate => "deals-update",
            StepName::UniverseUpdate => "universe-update",
            StepName::WeightsUpdate => "weights-update",
            StepName::Notification => "notification",
        }
    }

    /// Title-cased label used in notification messages.
    pub fn label(self) -> &'static str {
        match self {
            StepName::BalanceUpdate => "Balance Update",
            StepName::DealsUpdate => "Deals Update",
            StepName::UniverseUpdate => "Universe Update",
            StepName::WeightsUpdate => "Weights Update",
            StepName::Notification => "Notification",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepName {
    type Err = crate::error::RefreshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept the snake_case spelling used in config keys as well.
        match s.replace('_', "-").as_str() {
            "balance-update" => Ok(StepName::BalanceUpdate),
            "deals-update" => Ok(StepName::DealsUpdate),
            "universe-update" => Ok(StepName::UniverseUpdate),
            "weights-update" => Ok(StepName::WeightsUpdate),
            "notification" => Ok(StepName::Notification),
            _ => Err(crate::error::RefreshError::UnknownStep(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What started a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The daily scheduler fired.
    Scheduled,
    /// An operator asked for a run (CLI or HTTP).
    Manual,
    /// The retry coordinator re-ran a failed pipeline.
    Retry,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
            Trigger::Retry => "retry",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn data_steps_are_declared_order_without_notification() {
        assert_eq!(
            StepName::data_steps(),
            &[
                StepName::BalanceUpdate,
                StepName::DealsUpdate,
                StepName::UniverseUpdate,
                StepName::WeightsUpdate,
            ]
        );
        assert!(StepName::data_steps().iter().all(|s| s.is_data_step()));
        assert!(!StepName::Notification.is_data_step());
    }

    #[test]
    fn step_name_parses_kebab_and_snake_case() {
        assert_eq!(
            StepName::from_str("deals-update").unwrap(),
            StepName::DealsUpdate
        );
        assert_eq!(
            StepName::from_str("weights_update").unwrap(),
            StepName::WeightsUpdate
        );
        assert!(StepName::from_str("portfolio-update").is_err());
    }

    #[test]
    fn step_name_serializes_kebab_case() {
        let json = serde_json::to_string(&StepName::UniverseUpdate).unwrap();
        assert_eq!(json, "\"universe-update\"");
        for step in StepName::all() {
            assert_eq!(step.to_string(), step.as_str());
        }
    }
}
