use super::PipelineTarget;
use crate::output::{print_json, print_step_result};
use refresh_core::report::SingleStepView;
use refresh_core::types::StepName;
use std::path::Path;

pub fn run(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let step: StepName = name.parse()?;
    let target = super::pipeline_target(root)?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = match &target {
        PipelineTarget::Daemon(client) => rt.block_on(client.run_step(step))?,
        PipelineTarget::Local { orchestrator, .. } => {
            SingleStepView::from(&rt.block_on(orchestrator.run_single_step(step))?)
        }
    };

    if json {
        print_json(&result)?;
    } else {
        print_step_result(&result);
    }

    if let Some(err) = &result.error {
        anyhow::bail!("{step} failed: {err}");
    }
    Ok(())
}
