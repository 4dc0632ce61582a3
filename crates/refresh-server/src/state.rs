use std::sync::Arc;

use refresh_core::orchestrator::Orchestrator;
use refresh_core::schedule::ScheduleState;
use tokio::sync::watch;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Present when the server runs alongside the daemon's scheduler.
    pub schedule: Option<watch::Receiver<ScheduleState>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            schedule: None,
        }
    }

    pub fn with_schedule(mut self, schedule: watch::Receiver<ScheduleState>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn schedule_state(&self) -> Option<ScheduleState> {
        self.schedule.as_ref().map(|rx| rx.borrow().clone())
    }
}
