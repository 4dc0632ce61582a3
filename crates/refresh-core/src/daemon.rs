//! The long-running scheduled loop: wait for the daily trigger, run the
//! pipeline, repeat until cancelled.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::notify::{deliver_alert, Alert};
use crate::orchestrator::Orchestrator;
use crate::schedule::Scheduler;
use crate::types::Trigger;

/// Drive `orchestrator` from `scheduler` until `cancel` flips to `true`.
///
/// A scheduled fire that finds the orchestrator busy is skipped, not
/// queued, and operators are alerted. Only cancellation ends the loop; on
/// exit any pending retry is cancelled. Returns the number of scheduled
/// runs executed.
pub async fn run_daemon(
    orchestrator: Arc<Orchestrator>,
    mut scheduler: Scheduler,
    mut cancel: watch::Receiver<bool>,
) -> u32 {
    let recovering = Arc::clone(&orchestrator);
    match tokio::task::spawn_blocking(move || recovering.recover_interrupted()).await {
        Ok(Ok(0)) => {}
        Ok(Ok(n)) => warn!(recovered = n, "marked interrupted step runs as failed"),
        Ok(Err(e)) => warn!(error = %e, "step history recovery failed"),
        Err(e) => warn!(error = %e, "step history recovery task failed"),
    }

    info!(
        trigger_time = %scheduler.trigger(),
        utc_offset = %scheduler.offset(),
        "daemon started"
    );

    let mut runs = 0u32;
    while let Some(event) = scheduler.wait_for_next_trigger(&mut cancel).await {
        info!(
            scheduled_for = %event.scheduled_for.to_rfc3339(),
            "executing scheduled pipeline"
        );
        match orchestrator.run_full_pipeline(Trigger::Scheduled).await {
            Ok(report) => {
                runs += 1;
                info!(
                    run_id = %report.run_id,
                    success = report.overall_success(),
                    "scheduled run complete"
                );
            }
            Err(e) => {
                warn!(error = %e, "scheduled run skipped");
                let alert = Alert::error(
                    "PIPELINE SCHEDULER ERROR",
                    format!(
                        "Scheduled run for {} was skipped: {e}",
                        event.scheduled_for.with_timezone(&scheduler.offset()).to_rfc3339()
                    ),
                );
                deliver_alert(orchestrator.notifier().as_ref(), &alert).await;
            }
        }
        scheduler.mark_idle();
    }

    orchestrator.retry().cancel();
    info!(runs, "daemon stopped");
    runs
}
