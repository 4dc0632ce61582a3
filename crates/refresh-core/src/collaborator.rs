//! Step backends that call out to the data collaborators.
//!
//! A collaborator answers with a JSON payload on success. On failure it may
//! classify itself with a `{"kind": ..., "message": ...}` body; otherwise the
//! failure is classified from how it surfaced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{StepBackend, StepsConfig};
use crate::error::{RefreshError, Result};
use crate::step::{Step, StepError, StepOutcome};
use crate::types::StepName;

const TAIL_CHARS: usize = 400;

fn tail(s: &str) -> &str {
    let s = s.trim();
    match s.char_indices().rev().nth(TAIL_CHARS - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Parse a successful collaborator's output. Empty output is a `null` payload.
fn parse_payload(raw: &str) -> StepOutcome {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(trimmed)
        .map_err(|e| StepError::data(format!("collaborator output is not JSON: {e}")))
}

/// A self-reported `{"kind", "message"}` failure, if the body is one.
fn reported_error(raw: &str) -> Option<StepError> {
    serde_json::from_str::<StepError>(raw.trim()).ok()
}

/// Build the four data steps from configuration, in pipeline order.
pub fn build_steps(config: &StepsConfig, root: &Path) -> Result<Vec<Arc<dyn Step>>> {
    let mut steps: Vec<Arc<dyn Step>> = Vec::new();
    for name in StepName::data_steps() {
        let key = name.as_str().replace('-', "_");
        let backend = config
            .get(*name)
            .ok_or_else(|| RefreshError::Config(format!("steps.{key} is not configured")))?;
        let step: Arc<dyn Step> = match backend {
            StepBackend::Command { command, env } => Arc::new(CommandStep::new(
                *name,
                command.clone(),
                env.clone(),
                root.to_path_buf(),
            )),
            StepBackend::Http {
                url,
                timeout_seconds,
                bearer_token_env,
            } => {
                let token = bearer_token_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|t| !t.is_empty());
                Arc::new(HttpStep::new(
                    *name,
                    url.clone(),
                    Duration::from_secs(*timeout_seconds),
                    token,
                )?)
            }
        };
        steps.push(step);
    }
    Ok(steps)
}

// ---------------------------------------------------------------------------
// CommandStep
// ---------------------------------------------------------------------------

/// Runs a shell command in the project root.
///
/// Exit 0 yields stdout parsed as the JSON payload. A non-zero exit yields
/// the self-reported error on stdout when present, or a `data` error quoting
/// the tail of stderr. A command that cannot be spawned is a `transport`
/// failure. The child is killed if the step is cancelled by the runner's
/// timeout.
pub struct CommandStep {
    name: StepName,
    command: String,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
}

impl CommandStep {
    pub fn new(
        name: StepName,
        command: String,
        env: BTreeMap<String, String>,
        cwd: PathBuf,
    ) -> Self {
        Self {
            name,
            command,
            env,
            cwd,
        }
    }

    async fn execute(&self) -> StepOutcome {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .env("REFRESH_STEP", self.name.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StepError::transport(format!("failed to spawn '{}': {e}", self.command)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(step = %self.name, stderr = %tail(&stderr), "collaborator stderr");
        }

        if output.status.success() {
            return parse_payload(&stdout);
        }
        if let Some(err) = reported_error(&stdout) {
            return Err(err);
        }
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let detail = tail(&stderr);
        Err(StepError::data(if detail.is_empty() {
            format!("command exited with {code}")
        } else {
            format!("command exited with {code}: {detail}")
        }))
    }
}

impl Step for CommandStep {
    fn name(&self) -> StepName {
        self.name
    }

    fn run(&self) -> BoxFuture<'_, StepOutcome> {
        self.execute().boxed()
    }
}

// ---------------------------------------------------------------------------
// HttpStep
// ---------------------------------------------------------------------------

/// POSTs `{"step": <name>}` to a collaborator endpoint.
///
/// Unreachable endpoints and client timeouts are `transport`; 401/403 is
/// `auth`; 408, 429, and 5xx are `transport`; any other 4xx or an unreadable
/// body is `data`.
pub struct HttpStep {
    name: StepName,
    url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpStep {
    pub fn new(
        name: StepName,
        url: String,
        timeout: Duration,
        bearer_token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RefreshError::Config(format!("http client for {name}: {e}")))?;
        Ok(Self {
            name,
            url,
            client,
            bearer_token,
        })
    }

    async fn execute(&self) -> StepOutcome {
        let mut req = self
            .client
            .post(&self.url)
            .json(&json!({ "step": self.name.as_str() }));
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                StepError::transport(format!("{} timed out: {e}", self.url))
            } else {
                StepError::transport(format!("{} unreachable: {e}", self.url))
            }
        })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| StepError::transport(format!("reading response body: {e}")))?;

        if status.is_success() {
            return parse_payload(&body);
        }
        if let Some(err) = reported_error(&body) {
            return Err(err);
        }
        let message = format!("HTTP {status}: {}", tail(&body));
        Err(match status.as_u16() {
            401 | 403 => StepError::auth(message),
            408 | 429 => StepError::transport(message),
            s if s >= 500 => StepError::transport(message),
            _ => StepError::data(message),
        })
    }
}

impl Step for HttpStep {
    fn name(&self) -> StepName {
        self.name
    }

    fn run(&self) -> BoxFuture<'_, StepOutcome> {
        self.execute().boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
