//! Single-shot delayed retry of a failed pipeline run.
//!
//! Lifecycle: `Idle → Armed → Running → Idle`. A failed run arms one retry
//! of the whole pipeline after a fixed delay. Steps are idempotent upserts
//! keyed by account, date, and symbol, so re-running the steps that already
//! succeeded is harmless. The retry run itself is never retried; the next
//! scheduled day or an operator recovers it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::report::PipelineReport;
use crate::types::Trigger;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RetryState {
    Idle,
    Armed { fire_at: DateTime<Utc> },
    Running,
}

/// What the coordinator did with a finished report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The run succeeded; any pending retry was cancelled.
    NotNeeded,
    /// A retry was armed and will fire at `fire_at`.
    Scheduled { fire_at: DateTime<Utc> },
    /// A retry is already pending; no second one was armed.
    AlreadyArmed,
    /// The failed run was itself the retry.
    Exhausted,
    /// Automatic retry is turned off.
    Disabled,
}

struct Inner {
    state: RetryState,
    pending: Option<AbortHandle>,
}

pub struct RetryCoordinator {
    delay: Duration,
    enabled: bool,
    inner: Mutex<Inner>,
}

impl RetryCoordinator {
    pub fn new(delay: Duration, enabled: bool) -> Self {
        Self {
            delay,
            enabled,
            inner: Mutex::new(Inner {
                state: RetryState::Idle,
                pending: None,
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> RetryState {
        self.lock().state
    }

    /// Inspect a finished full-pipeline report and arm, skip, or disarm.
    ///
    /// `rerun` is spawned after the delay when a retry is armed; it should
    /// run the full pipeline with `Trigger::Retry`.
    pub fn on_pipeline_result<F>(
        self: &Arc<Self>,
        report: &PipelineReport,
        rerun: F,
    ) -> RetryDecision
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let success = report.overall_success();
        let mut inner = self.lock();

        if report.trigger == Trigger::Retry {
            inner.state = RetryState::Idle;
            inner.pending = None;
            if success {
                info!(run_id = %report.run_id, "retry run succeeded");
                return RetryDecision::NotNeeded;
            }
            warn!(
                run_id = %report.run_id,
                "retry run failed; no further automatic retry until the next scheduled run"
            );
            return RetryDecision::Exhausted;
        }

        if success {
            if let RetryState::Armed { .. } = inner.state {
                if let Some(handle) = inner.pending.take() {
                    handle.abort();
                }
                inner.state = RetryState::Idle;
                info!(run_id = %report.run_id, "pipeline recovered; pending retry cancelled");
            }
            return RetryDecision::NotNeeded;
        }

        if !self.enabled {
            info!(run_id = %report.run_id, "pipeline failed; automatic retry disabled");
            return RetryDecision::Disabled;
        }

        if !matches!(inner.state, RetryState::Idle) {
            info!(run_id = %report.run_id, "pipeline failed; a retry is already pending");
            return RetryDecision::AlreadyArmed;
        }

        let fire_at = Utc::now()
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero());
        let coordinator = Arc::clone(self);
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = coordinator.lock();
                inner.state = RetryState::Running;
                inner.pending = None;
            }
            info!("running delayed pipeline retry");
            rerun().await;
            // The retry run normally disarms through its own report; a run
            // refused as busy never produces one.
            let mut inner = coordinator.lock();
            if inner.state == RetryState::Running {
                inner.state = RetryState::Idle;
            }
        });
        inner.pending = Some(handle.abort_handle());
        inner.state = RetryState::Armed { fire_at };
        warn!(
            run_id = %report.run_id,
            fire_at = %fire_at.to_rfc3339(),
            delay_secs = delay.as_secs(),
            "pipeline failed; retry scheduled"
        );
        RetryDecision::Scheduled { fire_at }
    }

    /// Cancel any pending retry (daemon shutdown).
    pub fn cancel(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.pending.take() {
            handle.abort();
        }
        if let RetryState::Armed { .. } = inner.state {
            inner.state = RetryState::Idle;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded state stays consistent across a panic in another holder.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
