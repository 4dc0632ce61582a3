use super::PipelineTarget;
use crate::output::{print_json, print_report};
use refresh_core::types::Trigger;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let target = super::pipeline_target(root)?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = match &target {
        PipelineTarget::Daemon(client) => rt.block_on(client.run_pipeline())?,
        PipelineTarget::Local { orchestrator, .. } => rt
            .block_on(orchestrator.run_full_pipeline(Trigger::Manual))?
            .view(),
    };

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if !report.success {
        anyhow::bail!("pipeline finished with failed steps");
    }
    Ok(())
}
