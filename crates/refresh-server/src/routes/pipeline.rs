use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use refresh_core::orchestrator::Orchestrator;
use refresh_core::report::{ReportView, SingleStepView};
use refresh_core::types::{StepName, Trigger};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

/// POST /api/pipeline/run: run the full pipeline now and return its report.
///
/// The run is spawned so a client disconnect does not cancel it halfway.
pub async fn run_pipeline(State(app): State<AppState>) -> Result<Json<ReportView>, AppError> {
    let orchestrator = Arc::clone(&app.orchestrator);
    let report = tokio::spawn(async move { orchestrator.run_full_pipeline(Trigger::Manual).await })
        .await
        .map_err(|e| AppError(anyhow::anyhow!("pipeline task failed: {e}")))??;
    Ok(Json(report.view()))
}

/// POST /api/pipeline/steps/{step}/run: run one data step now.
pub async fn run_step(
    State(app): State<AppState>,
    Path(step): Path<String>,
) -> Result<Json<SingleStepView>, AppError> {
    let name: StepName = step.parse()?;
    let orchestrator: Arc<Orchestrator> = Arc::clone(&app.orchestrator);
    let result = tokio::spawn(async move { orchestrator.run_single_step(name).await })
        .await
        .map_err(|e| AppError(anyhow::anyhow!("step task failed: {e}")))??;

    Ok(Json(SingleStepView::from(&result)))
}

/// GET /api/pipeline/report: the most recent full-run report.
pub async fn get_report(State(app): State<AppState>) -> Result<Json<ReportView>, AppError> {
    let report = app
        .orchestrator
        .last_report()
        .ok_or_else(|| AppError::not_found("no pipeline run has completed yet"))?;
    Ok(Json(report.view()))
}

/// GET /api/pipeline/status: busy flag, active run, retry and schedule state.
pub async fn get_status(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let mut status = serde_json::to_value(app.orchestrator.status())?;
    if let Some(obj) = status.as_object_mut() {
        obj.insert(
            "schedule".into(),
            serde_json::to_value(app.schedule_state())?,
        );
        obj.insert(
            "steps".into(),
            serde_json::to_value(app.orchestrator.registry().names())?,
        );
    }
    Ok(Json(status))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /api/pipeline/history?limit=N: newest-first step tracking records.
pub async fn get_history(
    State(app): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let orchestrator = Arc::clone(&app.orchestrator);
    let records = tokio::task::spawn_blocking(move || orchestrator.recent_history(limit))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::to_value(records)?))
}
