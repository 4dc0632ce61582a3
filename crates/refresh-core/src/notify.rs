//! Pipeline summary notification and operator alerts.
//!
//! The notification step runs after the data steps and reports on them. A
//! delivery failure is recorded as the notification step's own result and
//! never alters the data steps' results. Alerts travel the same channel but
//! sit outside any report: skipped scheduled runs, a failed retry, and the
//! pre-run health check.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::NotificationConfig;
use crate::error::{RefreshError, Result};
use crate::report::PipelineReport;
use crate::step::{Step, StepError, StepOutcome};
use crate::types::StepName;

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;
    fn send<'a>(&'a self, report: &'a PipelineReport) -> BoxFuture<'a, StepOutcome>;
    fn alert<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, StepOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub detail: String,
}

impl Alert {
    pub fn info(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Info,
            title: title.into(),
            detail: detail.into(),
        }
    }

    pub fn error(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Error,
            title: title.into(),
            detail: detail.into(),
        }
    }
}

/// Send `alert` and log the outcome. Alerts are best effort: a delivery
/// failure never reaches the caller.
pub async fn deliver_alert(notifier: &dyn Notifier, alert: &Alert) {
    match notifier.alert(alert).await {
        Ok(_) => info!(channel = notifier.channel(), title = %alert.title, "alert sent"),
        Err(e) => warn!(
            channel = notifier.channel(),
            title = %alert.title,
            error = %e,
            "alert delivery failed"
        ),
    }
}

/// Binds a notifier to the report it summarizes so the runner can treat it
/// like any other step.
pub struct NotifyStep<'a> {
    pub notifier: &'a dyn Notifier,
    pub report: &'a PipelineReport,
}

impl Step for NotifyStep<'_> {
    fn name(&self) -> StepName {
        StepName::Notification
    }

    fn run(&self) -> BoxFuture<'_, StepOutcome> {
        self.notifier.send(self.report)
    }
}

pub fn build_notifier(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    match config {
        NotificationConfig::Log => Ok(Arc::new(LogNotifier)),
        NotificationConfig::Telegram {
            bot_token_env,
            chat_id,
            api_base,
            max_retries,
            retry_delay_ms,
        } => {
            // A missing token is not fatal: the notification step fails with
            // `auth` and the data steps still run.
            let bot_token = std::env::var(bot_token_env).unwrap_or_default();
            let notifier = TelegramNotifier::new(api_base, bot_token, chat_id)?
                .with_retries(*max_retries, Duration::from_millis(*retry_delay_ms));
            Ok(Arc::new(notifier))
        }
    }
}

// ---------------------------------------------------------------------------
// Summary formatting
// ---------------------------------------------------------------------------

/// Counters each step reports in its payload, with their display labels.
fn counters(step: StepName) -> &'static [(&'static str, &'static str)] {
    match step {
        StepName::BalanceUpdate => &[("updated_accounts", "Updated"), ("failed_accounts", "Failed")],
        StepName::DealsUpdate => &[("updated_accounts", "Accounts"), ("total_deals", "Deals")],
        StepName::UniverseUpdate => &[("updated_symbols", "Symbols")],
        StepName::WeightsUpdate => &[("updated_weights", "Weights")],
        StepName::Notification => &[],
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render the HTML summary sent to operators.
pub fn format_summary(report: &PipelineReport) -> String {
    let ok = report.overall_success();
    let mark = |success: bool| if success { "✅" } else { "❌" };
    let mut out = String::new();

    let _ = writeln!(out, "{} <b>Daily Pipeline Summary</b>", mark(ok));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "<b>Overall Status:</b> {}",
        if ok { "SUCCESS" } else { "FAILED" }
    );
    let _ = writeln!(out, "<b>Trigger:</b> {}", report.trigger);
    let _ = writeln!(
        out,
        "<b>Total Duration:</b> {:.2} seconds",
        report.total_duration_seconds()
    );
    let _ = writeln!(
        out,
        "<b>Successful Steps:</b> {}/{}",
        report.successful_steps(),
        report.steps.len()
    );
    let _ = writeln!(out);

    for step in &report.steps {
        let _ = writeln!(
            out,
            "{} <b>{}:</b> {:.2}s",
            mark(step.success),
            step.name.label(),
            step.duration_seconds()
        );
        if let Some(err) = &step.error {
            let _ = writeln!(
                out,
                "   Error ({}): {}",
                err.kind,
                escape_html(&err.message)
            );
            continue;
        }
        let Some(Value::Object(payload)) = &step.payload else {
            continue;
        };
        let parts: Vec<String> = counters(step.name)
            .iter()
            .filter_map(|(key, label)| payload.get(*key).map(|v| format!("{label}: {v}")))
            .collect();
        if !parts.is_empty() {
            let _ = writeln!(out, "   {}", parts.join(", "));
        }
    }

    let _ = writeln!(out);
    let _ = write!(
        out,
        "<b>Pipeline Time:</b> {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    out
}

/// Render an alert as a short HTML message.
pub fn format_alert(alert: &Alert) -> String {
    let mark = match alert.level {
        AlertLevel::Info => "ℹ️",
        AlertLevel::Error => "🚨",
    };
    format!(
        "{mark} <b>{}</b>\n\n{}",
        escape_html(&alert.title),
        escape_html(&alert.detail)
    )
}

// ---------------------------------------------------------------------------
// LogNotifier
// ---------------------------------------------------------------------------

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    fn send<'a>(&'a self, report: &'a PipelineReport) -> BoxFuture<'a, StepOutcome> {
        async move {
            info!(
                run_id = %report.run_id,
                success = report.overall_success(),
                summary = %format_summary(report),
                "pipeline summary"
            );
            Ok(json!({ "channel": "log", "sent_notifications": 1 }))
        }
        .boxed()
    }

    fn alert<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, StepOutcome> {
        async move {
            match alert.level {
                AlertLevel::Info => {
                    info!(title = %alert.title, detail = %alert.detail, "operator alert")
                }
                AlertLevel::Error => {
                    error!(title = %alert.title, detail = %alert.detail, "operator alert")
                }
            }
            Ok(json!({ "channel": "log", "sent_notifications": 1 }))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// TelegramNotifier
// ---------------------------------------------------------------------------

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, bot_token: String, chat_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RefreshError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token,
            chat_id: chat_id.to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// One delivery attempt. `Err` carries whether another attempt may help.
    async fn attempt(&self, text: &str) -> std::result::Result<(), (StepError, bool)> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            // The request URL embeds the bot token.
            .map_err(|e| {
                let e = e.without_url();
                (StepError::transport(format!("telegram unreachable: {e}")), true)
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 | 404 => Err((
                StepError::auth(format!("telegram rejected the bot token ({status})")),
                false,
            )),
            400 => Err((
                StepError::data(format!("telegram refused the message: {detail}")),
                false,
            )),
            _ => Err((
                StepError::transport(format!("telegram returned {status}: {detail}")),
                true,
            )),
        }
    }

    /// Deliver `text`, retrying transient failures with linear back-off.
    /// Returns the number of attempts used.
    async fn deliver(&self, text: &str) -> std::result::Result<u32, StepError> {
        if self.bot_token.is_empty() {
            return Err(StepError::auth("telegram bot token is not set"));
        }
        let mut last = StepError::transport("no delivery attempted");
        for attempt in 1..=self.max_retries {
            match self.attempt(text).await {
                Ok(()) => return Ok(attempt),
                Err((err, retryable)) => {
                    warn!(attempt, error = %err, "telegram delivery failed");
                    if !retryable {
                        return Err(err);
                    }
                    last = err;
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }
        Err(last)
    }
}

impl Notifier for TelegramNotifier {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    fn send<'a>(&'a self, report: &'a PipelineReport) -> BoxFuture<'a, StepOutcome> {
        async move {
            let attempts = self.deliver(&format_summary(report)).await?;
            info!(run_id = %report.run_id, attempts, "telegram summary sent");
            Ok(json!({
                "channel": "telegram",
                "sent_notifications": 1,
                "attempts": attempts,
            }))
        }
        .boxed()
    }

    fn alert<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, StepOutcome> {
        async move {
            let attempts = self.deliver(&format_alert(alert)).await?;
            Ok(json!({
                "channel": "telegram",
                "sent_notifications": 1,
                "attempts": attempts,
            }))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{ErrorKind, StepResult};
    use crate::types::Trigger;
    use mockito::{Matcher, Server};

    fn sample_report() -> PipelineReport {
        let mut report = PipelineReport::begin(Trigger::Scheduled);
        let t = report.started_at;
        let secs = chrono::Duration::milliseconds;
        report.push(StepResult::from_outcome(
            StepName::BalanceUpdate,
            t,
            t + secs(1500),
            Ok(json!({ "updated_accounts": 12, "failed_accounts": 1 })),
        ));
        report.push(StepResult::from_outcome(
            StepName::DealsUpdate,
            t + secs(1500),
            t + secs(2000),
            Err(StepError::transport("broker API <gateway> unreachable")),
        ));
        report.push(StepResult::from_outcome(
            StepName::UniverseUpdate,
            t + secs(2000),
            t + secs(2500),
            Ok(json!({ "updated_symbols": 40 })),
        ));
        report.push(StepResult::from_outcome(
            StepName::WeightsUpdate,
            t + secs(2500),
            t + secs(3000),
            Ok(Value::Null),
        ));
        report
    }

    #[test]
    fn summary_lists_every_step_with_counters_and_errors() {
        let text = format_summary(&sample_report());
        assert!(text.starts_with("❌ <b>Daily Pipeline Summary</b>"));
        assert!(text.contains("<b>Overall Status:</b> FAILED"));
        assert!(text.contains("<b>Successful Steps:</b> 3/4"));
        assert!(text.contains("<b>Total Duration:</b> 3.00 seconds"));
        assert!(text.contains("✅ <b>Balance Update:</b> 1.50s"));
        assert!(text.contains("Updated: 12, Failed: 1"));
        assert!(text.contains("Error (transport): broker API &lt;gateway&gt; unreachable"));
        assert!(text.contains("Symbols: 40"));
        assert!(text.contains("✅ <b>Weights Update:</b> 0.50s"));
        assert!(text.contains("<b>Pipeline Time:</b>"));
    }

    #[test]
    fn summary_of_clean_run_reports_success() {
        let mut report = PipelineReport::begin(Trigger::Manual);
        let t = report.started_at;
        report.push(StepResult::from_outcome(StepName::BalanceUpdate, t, t, Ok(Value::Null)));
        let text = format_summary(&report);
        assert!(text.starts_with("✅"));
        assert!(text.contains("SUCCESS"));
        assert!(text.contains("<b>Trigger:</b> manual"));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let payload = LogNotifier.send(&sample_report()).await.unwrap();
        assert_eq!(payload["channel"], "log");
    }

    #[tokio::test]
    async fn telegram_posts_html_message() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::PartialJson(json!({
                "chat_id": "-1001",
                "parse_mode": "HTML",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::new(&server.url(), "TOKEN".into(), "-1001").unwrap();
        let payload = notifier.send(&sample_report()).await.unwrap();
        assert_eq!(payload["attempts"], 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn telegram_retries_server_errors_then_fails_transport() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let notifier = TelegramNotifier::new(&server.url(), "TOKEN".into(), "-1001")
            .unwrap()
            .with_retries(3, Duration::from_millis(1));
        let err = notifier.send(&sample_report()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn telegram_bad_token_is_auth_without_retry() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/botBAD/sendMessage")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let notifier = TelegramNotifier::new(&server.url(), "BAD".into(), "-1001")
            .unwrap()
            .with_retries(3, Duration::from_millis(1));
        let err = notifier.send(&sample_report()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_telegram_error_never_carries_the_token() {
        let notifier = TelegramNotifier::new("http://127.0.0.1:1", "SECRET123".into(), "-1")
            .unwrap()
            .with_retries(1, Duration::from_millis(1));

        let err = notifier.send(&sample_report()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
        assert!(err.message.starts_with("telegram unreachable"), "{}", err.message);
        assert!(!err.message.contains("SECRET123"), "{}", err.message);

        let alert = Alert::error("PIPELINE SCHEDULER ERROR", "scheduled run skipped");
        let err = notifier.alert(&alert).await.unwrap_err();
        assert!(!err.message.contains("SECRET123"), "{}", err.message);
    }

    #[tokio::test]
    async fn telegram_sends_alert_as_html() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::PartialJson(json!({
                "chat_id": "-1001",
                "parse_mode": "HTML",
                "text": "🚨 <b>DAILY PIPELINE FAILED AFTER RETRY</b>\n\ndeals-update: transport",
            })))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::new(&server.url(), "TOKEN".into(), "-1001").unwrap();
        let alert = Alert::error("DAILY PIPELINE FAILED AFTER RETRY", "deals-update: transport");
        let payload = notifier.alert(&alert).await.unwrap();
        assert_eq!(payload["attempts"], 1);
        mock.assert_async().await;
    }

    #[test]
    fn alert_formatting_marks_level_and_escapes() {
        let info = format_alert(&Alert::info("Pipeline Scheduler Health Check", "runs in 1.5 hours"));
        assert_eq!(
            info,
            "ℹ️ <b>Pipeline Scheduler Health Check</b>\n\nruns in 1.5 hours"
        );
        let err = format_alert(&Alert::error("PIPELINE SCHEDULER ERROR", "busy: <step>"));
        assert!(err.starts_with("🚨 <b>PIPELINE SCHEDULER ERROR</b>"));
        assert!(err.ends_with("busy: &lt;step&gt;"));
    }

    #[tokio::test]
    async fn telegram_without_token_fails_auth() {
        let notifier = TelegramNotifier::new("http://127.0.0.1:9", String::new(), "-1").unwrap();
        let err = notifier.send(&sample_report()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }
}
