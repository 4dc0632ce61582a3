//! Pipeline orchestration.
//!
//! Provides the `Orchestrator` (sequencing, busy exclusion, retry hand-off),
//! the validated `StepRegistry`, and the redb-backed per-step tracking
//! history (`StepRunRecord`, `HistoryDb`).

pub mod db;
pub mod pipeline;
pub mod record;
pub mod registry;

pub use db::HistoryDb;
pub use pipeline::{Activity, Orchestrator, OrchestratorStatus};
pub use record::{RunStatus, StepRunRecord};
pub use registry::StepRegistry;
