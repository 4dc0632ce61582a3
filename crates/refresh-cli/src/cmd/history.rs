use crate::output::{print_json, print_table};
use crate::remote::DaemonClient;
use refresh_core::lock::current_holder;
use refresh_core::orchestrator::{HistoryDb, RunStatus, StepRunRecord};
use refresh_core::paths;
use std::path::Path;

pub fn run(root: &Path, limit: usize, json: bool) -> anyhow::Result<()> {
    // A running daemon holds the store open; ask it instead.
    let daemon = current_holder(root)?
        .filter(|h| h.is_daemon())
        .and_then(|h| h.control_url());
    let records = match daemon {
        Some(url) => {
            let client = DaemonClient::new(url)?;
            tokio::runtime::Runtime::new()?.block_on(client.history(limit))?
        }
        None => local_history(root, limit)?,
    };

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No step runs recorded yet.");
        return Ok(());
    }

    let rows = records
        .iter()
        .map(|r| {
            let detail = match &r.status {
                RunStatus::Failed { kind, reason } => match kind {
                    Some(k) => format!("{k}: {reason}"),
                    None => reason.clone(),
                },
                _ => String::new(),
            };
            vec![
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.step.to_string(),
                r.trigger.to_string(),
                r.status.label().to_string(),
                r.duration_seconds
                    .map(|d| format!("{d:.2}s"))
                    .unwrap_or_else(|| "-".into()),
                detail,
            ]
        })
        .collect();
    print_table(
        &["STARTED (UTC)", "STEP", "TRIGGER", "STATUS", "DURATION", "DETAIL"],
        rows,
    );
    Ok(())
}

fn local_history(root: &Path, limit: usize) -> anyhow::Result<Vec<StepRunRecord>> {
    let path = paths::history_path(root);
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(HistoryDb::open(&path)?.recent(limit)?)
}
