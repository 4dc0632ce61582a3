pub mod check;
pub mod daemon;
pub mod history;
pub mod init;
pub mod next;
pub mod run;
pub mod step;

use crate::remote::DaemonClient;
use anyhow::Context;
use refresh_core::config::Config;
use refresh_core::error::RefreshError;
use refresh_core::lock::{current_holder, ProcessLock, MANUAL_HOLDER};
use refresh_core::orchestrator::Orchestrator;
use std::path::Path;
use std::sync::Arc;

/// Where a one-shot pipeline command executes.
pub(crate) enum PipelineTarget {
    /// A daemon owns execution; the request goes over its control surface.
    Daemon(DaemonClient),
    /// No daemon: run here while holding the process lock.
    Local {
        orchestrator: Arc<Orchestrator>,
        _lock: ProcessLock,
    },
}

/// Load config, then either forward to the running daemon or take the
/// process lock and wire a local orchestrator.
///
/// Automatic retry is switched off locally: a one-shot process exits long
/// before a delayed retry could fire. The daemon owns retries.
pub(crate) fn pipeline_target(root: &Path) -> anyhow::Result<PipelineTarget> {
    let mut config = Config::load(root).context("failed to load config")?;

    if let Some(holder) = current_holder(root)?.filter(|h| h.is_daemon()) {
        let Some(url) = holder.control_url() else {
            return Err(RefreshError::Busy {
                active: format!("{holder} with no control surface"),
            }
            .into());
        };
        let client = DaemonClient::new(url)?;
        tracing::info!(daemon = client.base(), "forwarding to the running daemon");
        return Ok(PipelineTarget::Daemon(client));
    }

    let lock = ProcessLock::acquire(root, MANUAL_HOLDER)?;
    config.retry.enabled = false;
    let orchestrator =
        Orchestrator::from_config(&config, root).context("failed to build pipeline")?;
    Ok(PipelineTarget::Local {
        orchestrator: Arc::new(orchestrator),
        _lock: lock,
    })
}
