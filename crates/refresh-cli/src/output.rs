use refresh_core::report::{ReportView, SingleStepView};
use refresh_core::step::StepError;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<String>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{cell:width$}", width = *w))
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };

    line(headers.iter().map(|h| h.to_string()).collect());
    line(widths.iter().map(|w| "-".repeat(*w)).collect());
    for row in rows {
        line(row);
    }
}

fn outcome_cell(error: Option<&StepError>) -> String {
    match error {
        None => "ok".to_string(),
        Some(e) => format!("FAILED ({}): {}", e.kind, e.message),
    }
}

pub fn print_report(report: &ReportView) {
    let rows = report
        .steps
        .iter()
        .map(|(name, step)| {
            vec![
                name.to_string(),
                format!("{:.2}s", step.duration_seconds),
                outcome_cell(step.error.as_ref()),
            ]
        })
        .collect();
    print_table(&["STEP", "DURATION", "OUTCOME"], rows);
    println!();
    println!(
        "{} ({}/{} steps ok, {:.2}s, run {})",
        if report.success { "SUCCESS" } else { "FAILED" },
        report.steps.iter().filter(|(_, s)| s.success).count(),
        report.steps.len(),
        report.total_duration,
        report.run_id
    );
}

pub fn print_step_result(result: &SingleStepView) {
    println!(
        "{}: {} in {:.2}s",
        result.step,
        outcome_cell(result.error.as_ref()),
        result.duration_seconds
    );
    if let Some(payload) = result.result.as_ref().filter(|p| !p.is_null()) {
        println!("{payload}");
    }
}
