//! Client for a running daemon's control surface.
//!
//! One-shot commands forward here when the daemon holds the process lock,
//! so the daemon stays the single executor.

use std::time::Duration;

use anyhow::{anyhow, bail};
use refresh_core::orchestrator::StepRunRecord;
use refresh_core::report::{ReportView, SingleStepView};
use refresh_core::types::StepName;
use serde::de::DeserializeOwned;

pub struct DaemonClient {
    base: String,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(base: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base: base.into(),
            http,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn run_pipeline(&self) -> anyhow::Result<ReportView> {
        let url = format!("{}/api/pipeline/run", self.base);
        self.send(self.http.post(url)).await
    }

    pub async fn run_step(&self, step: StepName) -> anyhow::Result<SingleStepView> {
        let url = format!("{}/api/pipeline/steps/{step}/run", self.base);
        self.send(self.http.post(url)).await
    }

    pub async fn history(&self, limit: usize) -> anyhow::Result<Vec<StepRunRecord>> {
        let url = format!("{}/api/pipeline/history", self.base);
        self.send(self.http.get(url).query(&[("limit", limit)])).await
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> anyhow::Result<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow!("daemon at {} unreachable: {e}", self.base))?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            bail!("{message}");
        }
        Ok(resp.json().await?)
    }
}
