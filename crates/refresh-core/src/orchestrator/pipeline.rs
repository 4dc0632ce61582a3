use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborator::build_steps;
use crate::config::Config;
use crate::error::{RefreshError, Result};
use crate::notify::{build_notifier, deliver_alert, Alert, Notifier, NotifyStep};
use crate::paths;
use crate::report::PipelineReport;
use crate::retry::{RetryCoordinator, RetryDecision, RetryState};
use crate::runner::StepRunner;
use crate::step::{Step, StepResult};
use crate::types::{StepName, Trigger};

use super::db::HistoryDb;
use super::record::StepRunRecord;
use super::registry::StepRegistry;

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// The execution currently holding the run lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activity {
    Pipeline {
        run_id: Uuid,
        trigger: Trigger,
        started_at: DateTime<Utc>,
    },
    Step {
        step: StepName,
        started_at: DateTime<Utc>,
    },
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Pipeline { trigger, .. } => write!(f, "{trigger} pipeline run"),
            Activity::Step { step, .. } => write!(f, "step {step}"),
        }
    }
}

/// Snapshot for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub busy: bool,
    pub active: Option<Activity>,
    pub retry: RetryState,
    pub last_run_id: Option<Uuid>,
    pub last_success: Option<bool>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// Holds the run lock and clears the active marker on drop.
struct RunGuard<'a> {
    _lock: tokio::sync::MutexGuard<'a, ()>,
    active: &'a Mutex<Option<Activity>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Sequences the data steps, dispatches the summary notification, and
/// hands failed runs to the retry coordinator.
///
/// At most one execution (full pipeline or single step) runs at a time. A
/// request that arrives while another is active fails fast with
/// [`RefreshError::Busy`]; it is never queued.
pub struct Orchestrator {
    registry: StepRegistry,
    notifier: Arc<dyn Notifier>,
    runner: StepRunner,
    retry: Arc<RetryCoordinator>,
    history: Option<Arc<HistoryDb>>,
    retention: usize,
    run_lock: tokio::sync::Mutex<()>,
    active: Mutex<Option<Activity>>,
    last_report: RwLock<Option<PipelineReport>>,
}

impl Orchestrator {
    pub fn new(
        registry: StepRegistry,
        notifier: Arc<dyn Notifier>,
        runner: StepRunner,
        retry: RetryCoordinator,
    ) -> Self {
        Self {
            registry,
            notifier,
            runner,
            retry: Arc::new(retry),
            history: None,
            retention: 0,
            run_lock: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            last_report: RwLock::new(None),
        }
    }

    /// Track every step execution in `db`, keeping at most `retention`
    /// records (0 keeps everything).
    pub fn with_history(mut self, db: HistoryDb, retention: usize) -> Self {
        self.history = Some(Arc::new(db));
        self.retention = retention;
        self
    }

    /// Wire collaborators, notifier, runner, retry, and history from config.
    pub fn from_config(config: &Config, root: &Path) -> Result<Self> {
        let registry = StepRegistry::new(build_steps(&config.steps, root)?)?;
        let notifier = build_notifier(&config.notification)?;
        let runner = StepRunner::new(config.runner.max_step_duration());
        let retry = RetryCoordinator::new(config.retry.delay(), config.retry.enabled);
        let mut orchestrator = Self::new(registry, notifier, runner, retry);
        if config.history.enabled {
            let db = HistoryDb::open(&paths::history_path(root))?;
            orchestrator = orchestrator.with_history(db, config.history.retention);
        }
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn retry(&self) -> &Arc<RetryCoordinator> {
        &self.retry
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn history(&self) -> Option<&HistoryDb> {
        self.history.as_deref()
    }

    /// Newest-first tracking records; empty when history is disabled.
    /// Blocking, like `recover_interrupted`.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<StepRunRecord>> {
        match &self.history {
            Some(db) => db.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    /// Mark records left `Running` by a previous process as failed.
    /// Blocking: call from `spawn_blocking` inside the runtime.
    pub fn recover_interrupted(&self) -> Result<u32> {
        match &self.history {
            Some(db) => db.startup_recovery(Duration::ZERO),
            None => Ok(0),
        }
    }

    pub fn last_report(&self) -> Option<PipelineReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active(&self) -> Option<Activity> {
        self.active_slot().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let last = self.last_report();
        let active = self.active();
        OrchestratorStatus {
            busy: active.is_some(),
            active,
            retry: self.retry.state(),
            last_run_id: last.as_ref().map(|r| r.run_id),
            last_success: last.as_ref().map(|r| r.overall_success()),
            last_finished_at: last.as_ref().map(|r| r.ended_at),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Run every data step in order, then the notification step.
    ///
    /// Step failures never stop the pipeline and never surface as `Err`;
    /// they are recorded in the report. `Err` is reserved for a busy
    /// orchestrator.
    pub async fn run_full_pipeline(self: &Arc<Self>, trigger: Trigger) -> Result<PipelineReport> {
        let mut report = PipelineReport::begin(trigger);
        let run_id = report.run_id;
        let guard = self.acquire(Activity::Pipeline {
            run_id,
            trigger,
            started_at: report.started_at,
        })?;
        info!(%run_id, %trigger, "pipeline started");

        for step in self.registry.steps() {
            let result = self.run_tracked(step.as_ref(), Some(run_id), trigger).await;
            report.push(result);
        }

        let notification = {
            let step = NotifyStep {
                notifier: self.notifier.as_ref(),
                report: &report,
            };
            self.run_tracked(&step, Some(run_id), trigger).await
        };
        report.push(notification);
        let report = report.finish();

        let failed: Vec<&str> = report.failed_steps().map(|s| s.name.as_str()).collect();
        if failed.is_empty() {
            info!(
                %run_id,
                duration_secs = report.total_duration_seconds(),
                "pipeline finished successfully"
            );
        } else {
            warn!(
                %run_id,
                duration_secs = report.total_duration_seconds(),
                failed = %failed.join(","),
                "pipeline finished with failures"
            );
        }

        *self
            .last_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        self.prune_history().await;

        // The lock is free before a retry can be armed, whatever its delay.
        drop(guard);

        let orchestrator = Arc::clone(self);
        let decision = self
            .retry
            .on_pipeline_result(&report, move || retry_run(orchestrator));
        match decision {
            RetryDecision::Scheduled { fire_at } => {
                info!(%run_id, fire_at = %fire_at.to_rfc3339(), "retry armed");
            }
            RetryDecision::Exhausted => {
                let alert = Alert::error(
                    "DAILY PIPELINE FAILED AFTER RETRY",
                    failure_detail(&report),
                );
                deliver_alert(self.notifier.as_ref(), &alert).await;
            }
            RetryDecision::Disabled if trigger == Trigger::Scheduled => {
                let alert = Alert::error(
                    "DAILY PIPELINE FAILED",
                    format!("{} (automatic retry is disabled)", failure_detail(&report)),
                );
                deliver_alert(self.notifier.as_ref(), &alert).await;
            }
            _ => {}
        }

        Ok(report)
    }

    /// Run one data step on its own, outside any pipeline report.
    ///
    /// The step runs whether or not earlier steps are fresh. Its outcome
    /// does not arm a retry and does not replace the last report.
    pub async fn run_single_step(&self, name: StepName) -> Result<StepResult> {
        if !name.is_data_step() {
            return Err(RefreshError::StepNotRunnable(name.to_string()));
        }
        let step = self
            .registry
            .get(name)
            .ok_or_else(|| RefreshError::UnknownStep(name.to_string()))?;
        let _guard = self.acquire(Activity::Step {
            step: name,
            started_at: Utc::now(),
        })?;
        info!(step = %name, "single step run requested");
        Ok(self.run_tracked(step.as_ref(), None, Trigger::Manual).await)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn active_slot(&self) -> MutexGuard<'_, Option<Activity>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, activity: Activity) -> Result<RunGuard<'_>> {
        let lock = match self.run_lock.try_lock() {
            Ok(lock) => lock,
            Err(_) => {
                let active = self
                    .active()
                    .map_or_else(|| "another run".to_string(), |a| a.to_string());
                warn!(requested = %activity, %active, "rejected: pipeline busy");
                return Err(RefreshError::Busy { active });
            }
        };
        *self.active_slot() = Some(activity);
        Ok(RunGuard {
            _lock: lock,
            active: &self.active,
        })
    }

    async fn run_tracked(
        &self,
        step: &dyn Step,
        run_id: Option<Uuid>,
        trigger: Trigger,
    ) -> StepResult {
        let mut record = StepRunRecord::started(run_id, trigger, step.name());
        self.track(&record).await;
        let result = self.runner.run_step(step).await;
        record.finish(&result);
        self.track(&record).await;
        result
    }

    /// History is best effort: a store failure is logged, never propagated
    /// into the step's result. redb commits block, so they run off the
    /// async workers.
    async fn track(&self, record: &StepRunRecord) {
        let Some(db) = &self.history else { return };
        let db = Arc::clone(db);
        let owned = record.clone();
        let written = tokio::task::spawn_blocking(move || db.put(&owned))
            .await
            .map_err(|e| RefreshError::History(format!("history task failed: {e}")))
            .and_then(|r| r);
        if let Err(e) = written {
            warn!(step = %record.step, error = %e, "failed to write step history");
        }
    }

    async fn prune_history(&self) {
        let Some(db) = &self.history else { return };
        if self.retention == 0 {
            return;
        }
        let db = Arc::clone(db);
        let keep = self.retention;
        let pruned = tokio::task::spawn_blocking(move || db.enforce_retention(keep))
            .await
            .map_err(|e| RefreshError::History(format!("history task failed: {e}")))
            .and_then(|r| r);
        match pruned {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "pruned step history"),
            Err(e) => warn!(error = %e, "failed to prune step history"),
        }
    }
}

/// One line per failed step, for operator alerts.
fn failure_detail(report: &PipelineReport) -> String {
    let failed: Vec<String> = report
        .failed_steps()
        .map(|s| match &s.error {
            Some(e) => format!("{}: {e}", s.name),
            None => s.name.to_string(),
        })
        .collect();
    format!(
        "{} run {} finished with {} failed step(s):\n{}",
        report.trigger,
        report.run_id,
        failed.len(),
        failed.join("\n")
    )
}

/// The delayed retry body. Boxed with an explicit type so the retry closure
/// does not make `run_full_pipeline`'s future recursive.
fn retry_run(orchestrator: Arc<Orchestrator>) -> BoxFuture<'static, ()> {
    async move {
        match orchestrator.run_full_pipeline(Trigger::Retry).await {
            Ok(report) => info!(
                run_id = %report.run_id,
                success = report.overall_success(),
                "retry run finished"
            ),
            Err(RefreshError::Busy { active }) => {
                warn!(%active, "retry skipped: pipeline busy")
            }
            Err(e) => error!(error = %e, "retry run failed to start"),
        }
    }
    .boxed()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::notify::{AlertLevel, LogNotifier};
    use crate::retry::DEFAULT_RETRY_DELAY;
    use crate::step::{ErrorKind, FnStep, StepError, StepOutcome};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    type Script = Arc<dyn Fn(StepName) -> StepOutcome + Send + Sync>;

    /// Steps whose outcome is decided by `script`, counting invocations.
    fn scripted(script: Script, calls: &Arc<AtomicUsize>) -> StepRegistry {
        let steps = StepName::data_steps()
            .iter()
            .map(|name| {
                let name = *name;
                let script = Arc::clone(&script);
                let calls = Arc::clone(calls);
                Arc::new(FnStep::new(name, move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let outcome = script(name);
                    async move { outcome }
                })) as Arc<dyn Step>
            })
            .collect();
        StepRegistry::new(steps).unwrap()
    }

    fn all_ok() -> Script {
        Arc::new(|name| Ok(json!({ "step": name.as_str() })))
    }

    fn orchestrator(registry: StepRegistry, notifier: Arc<dyn Notifier>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            registry,
            notifier,
            StepRunner::default(),
            RetryCoordinator::new(DEFAULT_RETRY_DELAY, true),
        ))
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn channel(&self) -> &'static str {
            "failing"
        }

        fn send<'a>(&'a self, _report: &'a PipelineReport) -> BoxFuture<'a, StepOutcome> {
            async { Err(StepError::transport("chat API unreachable")) }.boxed()
        }

        fn alert<'a>(&'a self, _alert: &'a Alert) -> BoxFuture<'a, StepOutcome> {
            async { Err(StepError::transport("chat API unreachable")) }.boxed()
        }
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(scripted(all_ok(), &calls), Arc::new(LogNotifier));

        let report = orch.run_full_pipeline(Trigger::Manual).await.unwrap();

        let names: Vec<StepName> = report.steps.iter().map(|s| s.name).collect();
        assert_eq!(names, StepName::all());
        assert!(report.overall_success());
        assert_eq!(report.successful_steps(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(orch.retry().state(), RetryState::Idle);
        assert_eq!(orch.last_report().unwrap().run_id, report.run_id);
        assert!(!orch.is_busy());
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_later_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(|name| match name {
            StepName::UniverseUpdate => Err(StepError::data("price feed returned no symbols")),
            _ => Ok(Value::Null),
        });
        let orch = orchestrator(scripted(script, &calls), Arc::new(LogNotifier));

        let report = orch.run_full_pipeline(Trigger::Scheduled).await.unwrap();

        assert_eq!(report.steps.len(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let universe = report.step(StepName::UniverseUpdate).unwrap();
        assert_eq!(universe.error_kind(), Some(ErrorKind::Data));
        assert!(report.step(StepName::WeightsUpdate).unwrap().success);
        assert!(report.step(StepName::Notification).unwrap().success);
        assert!(!report.overall_success());
        orch.retry().cancel();
    }

    #[tokio::test]
    async fn steps_run_back_to_back_with_consistent_timing() {
        let steps: Vec<Arc<dyn Step>> = StepName::data_steps()
            .iter()
            .map(|name| {
                let failing = *name == StepName::UniverseUpdate;
                Arc::new(FnStep::new(*name, move || async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if failing {
                        Err(StepError::data("price feed returned no symbols"))
                    } else {
                        Ok(Value::Null)
                    }
                })) as Arc<dyn Step>
            })
            .collect();
        let orch = orchestrator(StepRegistry::new(steps).unwrap(), Arc::new(LogNotifier));

        let report = orch.run_full_pipeline(Trigger::Manual).await.unwrap();

        assert_eq!(report.steps.len(), 5);
        for pair in report.steps.windows(2) {
            assert!(
                pair[1].started_at >= pair[0].ended_at,
                "{} started before {} ended",
                pair[1].name,
                pair[0].name
            );
        }
        for step in &report.steps {
            assert_eq!(step.duration(), step.ended_at - step.started_at);
            assert!(step.duration() >= chrono::Duration::zero());
        }
        assert!(report.started_at <= report.steps[0].started_at);
        assert!(report.ended_at >= report.steps[4].ended_at);
    }

    #[tokio::test]
    async fn notification_failure_keeps_data_results() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(scripted(all_ok(), &calls), Arc::new(FailingNotifier));

        let report = orch.run_full_pipeline(Trigger::Manual).await.unwrap();

        assert!(report.data_success());
        assert!(!report.overall_success());
        let note = report.step(StepName::Notification).unwrap();
        assert_eq!(note.error_kind(), Some(ErrorKind::Transport));
        orch.retry().cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_arms_one_retry_that_runs_after_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deals_calls = Arc::new(AtomicUsize::new(0));
        let script: Script = {
            let deals_calls = Arc::clone(&deals_calls);
            Arc::new(move |name| match name {
                StepName::DealsUpdate if deals_calls.fetch_add(1, Ordering::SeqCst) == 0 => {
                    Err(StepError::transport("broker API unreachable"))
                }
                _ => Ok(Value::Null),
            })
        };
        let orch = orchestrator(scripted(script, &calls), Arc::new(LogNotifier));

        let first = orch.run_full_pipeline(Trigger::Scheduled).await.unwrap();
        assert!(!first.overall_success());
        assert_eq!(
            first.step(StepName::DealsUpdate).unwrap().error_kind(),
            Some(ErrorKind::Transport)
        );
        assert!(first.step(StepName::UniverseUpdate).unwrap().success);
        assert!(matches!(orch.retry().state(), RetryState::Armed { .. }));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        tokio::time::sleep(Duration::from_secs(2)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        let retried = orch.last_report().unwrap();
        assert_eq!(retried.trigger, Trigger::Retry);
        assert!(retried.overall_success());
        assert_eq!(orch.retry().state(), RetryState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Script =
            Arc::new(|_| Err(StepError::transport("broker API unreachable")));
        let orch = orchestrator(scripted(script, &calls), Arc::new(LogNotifier));

        orch.run_full_pipeline(Trigger::Scheduled).await.unwrap();
        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(orch.last_report().unwrap().trigger, Trigger::Retry);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(orch.retry().state(), RetryState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_retry_never_finds_its_own_run_holding_the_lock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deals_calls = Arc::new(AtomicUsize::new(0));
        let script: Script = {
            let deals_calls = Arc::clone(&deals_calls);
            Arc::new(move |name| match name {
                StepName::DealsUpdate if deals_calls.fetch_add(1, Ordering::SeqCst) == 0 => {
                    Err(StepError::transport("broker API unreachable"))
                }
                _ => Ok(Value::Null),
            })
        };
        let orch = Arc::new(Orchestrator::new(
            scripted(script, &calls),
            Arc::new(LogNotifier),
            StepRunner::default(),
            RetryCoordinator::new(Duration::ZERO, true),
        ));

        orch.run_full_pipeline(Trigger::Scheduled).await.unwrap();

        let retried = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(report) = orch.last_report().filter(|r| r.trigger == Trigger::Retry) {
                    return report;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("retry run never completed");
        assert!(retried.overall_success());
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_alerts_operators() {
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(|name| match name {
            StepName::BalanceUpdate => Err(StepError::transport("broker API unreachable")),
            _ => Ok(Value::Null),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let orch = orchestrator(scripted(script, &calls), notifier.clone());

        orch.run_full_pipeline(Trigger::Scheduled).await.unwrap();
        assert!(notifier.alerts().is_empty(), "first failure only arms a retry");

        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Error);
        assert!(alerts[0].title.contains("AFTER RETRY"));
        assert!(alerts[0].detail.contains("balance-update"), "{}", alerts[0].detail);
        assert!(alerts[0].detail.contains("broker API unreachable"));
    }

    #[tokio::test]
    async fn scheduled_failure_without_retry_alerts_but_manual_does_not() {
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(|_| Err(StepError::auth("session expired")));
        let notifier = Arc::new(RecordingNotifier::default());
        let orch = Arc::new(Orchestrator::new(
            scripted(script, &calls),
            notifier.clone(),
            StepRunner::default(),
            RetryCoordinator::new(DEFAULT_RETRY_DELAY, false),
        ));

        orch.run_full_pipeline(Trigger::Manual).await.unwrap();
        assert!(notifier.alerts().is_empty());

        orch.run_full_pipeline(Trigger::Scheduled).await.unwrap();
        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].detail.contains("retry is disabled"));
    }

    #[tokio::test]
    async fn concurrent_requests_fail_fast_while_busy() {
        let gate = Arc::new(Notify::new());
        let steps: Vec<Arc<dyn Step>> = StepName::data_steps()
            .iter()
            .map(|name| {
                let gate = Arc::clone(&gate);
                let blocking = *name == StepName::BalanceUpdate;
                Arc::new(FnStep::new(*name, move || {
                    let gate = Arc::clone(&gate);
                    async move {
                        if blocking {
                            gate.notified().await;
                        }
                        Ok::<_, StepError>(Value::Null)
                    }
                })) as Arc<dyn Step>
            })
            .collect();
        let orch = orchestrator(StepRegistry::new(steps).unwrap(), Arc::new(LogNotifier));

        let running = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.run_full_pipeline(Trigger::Scheduled).await }
        });
        while !orch.is_busy() {
            tokio::task::yield_now().await;
        }

        let err = orch.run_full_pipeline(Trigger::Manual).await.unwrap_err();
        match err {
            RefreshError::Busy { active } => assert!(active.contains("scheduled"), "{active}"),
            other => panic!("expected Busy, got {other:?}"),
        }
        assert!(matches!(
            orch.run_single_step(StepName::WeightsUpdate).await,
            Err(RefreshError::Busy { .. })
        ));
        assert!(matches!(orch.active(), Some(Activity::Pipeline { .. })));

        gate.notify_one();
        let report = running.await.unwrap().unwrap();
        assert!(report.overall_success());
        assert!(!orch.is_busy());

        // Lock released: the next request proceeds.
        orch.run_single_step(StepName::WeightsUpdate).await.unwrap();
    }

    #[tokio::test]
    async fn single_step_runs_only_that_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(scripted(all_ok(), &calls), Arc::new(LogNotifier));

        let result = orch.run_single_step(StepName::UniverseUpdate).await.unwrap();

        assert!(result.success);
        assert_eq!(result.name, StepName::UniverseUpdate);
        assert_eq!(result.payload.unwrap()["step"], "universe-update");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(orch.last_report().is_none());
    }

    #[tokio::test]
    async fn single_step_failure_does_not_arm_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(|_| Err(StepError::auth("session expired")));
        let orch = orchestrator(scripted(script, &calls), Arc::new(LogNotifier));

        let result = orch.run_single_step(StepName::BalanceUpdate).await.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Auth));
        assert_eq!(orch.retry().state(), RetryState::Idle);
    }

    #[tokio::test]
    async fn notification_is_not_runnable_alone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(scripted(all_ok(), &calls), Arc::new(LogNotifier));
        assert!(matches!(
            orch.run_single_step(StepName::Notification).await,
            Err(RefreshError::StepNotRunnable(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn history_tracks_every_step_execution() {
        let dir = TempDir::new().unwrap();
        let db = HistoryDb::open(&dir.path().join("history.redb")).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(|name| match name {
            StepName::WeightsUpdate => Err(StepError::persistence("disk full")),
            _ => Ok(Value::Null),
        });
        let orch = Arc::new(
            Orchestrator::new(
                scripted(script, &calls),
                Arc::new(LogNotifier),
                StepRunner::default(),
                RetryCoordinator::new(DEFAULT_RETRY_DELAY, false),
            )
            .with_history(db, 100),
        );

        let report = orch.run_full_pipeline(Trigger::Manual).await.unwrap();
        let records = orch.recent_history(10).unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.run_id == Some(report.run_id)));
        let weights = records
            .iter()
            .find(|r| r.step == StepName::WeightsUpdate)
            .unwrap();
        assert_eq!(weights.status.label(), "failed");
        assert_eq!(orch.recover_interrupted().unwrap(), 0);
    }

    #[tokio::test]
    async fn status_reflects_last_report() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(scripted(all_ok(), &calls), Arc::new(LogNotifier));
        assert!(orch.status().last_run_id.is_none());

        let report = orch.run_full_pipeline(Trigger::Manual).await.unwrap();
        let status = orch.status();
        assert!(!status.busy);
        assert_eq!(status.last_run_id, Some(report.run_id));
        assert_eq!(status.last_success, Some(true));
    }
}
