use crate::error::{RefreshError, Result};
use crate::paths;
use crate::schedule::{parse_utc_offset, DailyTrigger};
use crate::types::StepName;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Daily trigger time, `HH:MM`, in `utc_offset`.
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_heartbeat_minutes")]
    pub heartbeat_minutes: u64,
    /// Heartbeats this close to the trigger also alert operators. 0 disables.
    #[serde(default = "default_health_check_minutes")]
    pub health_check_minutes: u64,
}

fn default_time() -> String {
    "19:00".to_string()
}

fn default_utc_offset() -> String {
    "+07:00".to_string()
}

fn default_heartbeat_minutes() -> u64 {
    60
}

fn default_health_check_minutes() -> u64 {
    120
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            time: default_time(),
            utc_offset: default_utc_offset(),
            heartbeat_minutes: default_heartbeat_minutes(),
            health_check_minutes: default_health_check_minutes(),
        }
    }
}

impl ScheduleConfig {
    pub fn trigger(&self) -> Result<DailyTrigger> {
        self.time.parse()
    }

    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_minutes.max(1) * 60)
    }

    pub fn health_check_within(&self) -> Option<Duration> {
        (self.health_check_minutes > 0).then(|| Duration::from_secs(self.health_check_minutes * 60))
    }
}

// ---------------------------------------------------------------------------
// RetryConfig / RunnerConfig / HistoryConfig / ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retry_delay")]
    pub delay_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_seconds: default_retry_delay(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on a single step. `null` disables the bound.
    #[serde(default = "default_max_step_seconds")]
    pub max_step_seconds: Option<u64>,
}

fn default_max_step_seconds() -> Option<u64> {
    Some(1800)
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_step_seconds: default_max_step_seconds(),
        }
    }
}

impl RunnerConfig {
    pub fn max_step_duration(&self) -> Option<Duration> {
        self.max_step_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_retention() -> usize {
    500
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepBackend / StepsConfig
// ---------------------------------------------------------------------------

/// How a data step's collaborator is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepBackend {
    /// Shell command; JSON on stdout is the payload.
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// HTTP POST; JSON response body is the payload.
    Http {
        url: String,
        #[serde(default = "default_http_timeout")]
        timeout_seconds: u64,
        /// Name of the env var holding a bearer token, if the endpoint needs one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token_env: Option<String>,
    },
}

fn default_http_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_update: Option<StepBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deals_update: Option<StepBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universe_update: Option<StepBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_update: Option<StepBackend>,
}

impl StepsConfig {
    pub fn get(&self, step: StepName) -> Option<&StepBackend> {
        match step {
            StepName::BalanceUpdate => self.balance_update.as_ref(),
            StepName::DealsUpdate => self.deals_update.as_ref(),
            StepName::UniverseUpdate => self.universe_update.as_ref(),
            StepName::WeightsUpdate => self.weights_update.as_ref(),
            StepName::Notification => None,
        }
    }

    pub fn set(&mut self, step: StepName, backend: StepBackend) {
        let slot = match step {
            StepName::BalanceUpdate => &mut self.balance_update,
            StepName::DealsUpdate => &mut self.deals_update,
            StepName::UniverseUpdate => &mut self.universe_update,
            StepName::WeightsUpdate => &mut self.weights_update,
            StepName::Notification => return,
        };
        *slot = Some(backend);
    }
}

// ---------------------------------------------------------------------------
// NotificationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationConfig {
    /// Write the summary to the log only.
    Log,
    Telegram {
        #[serde(default = "default_bot_token_env")]
        bot_token_env: String,
        chat_id: String,
        #[serde(default = "default_telegram_api")]
        api_base: String,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_retry_delay_ms")]
        retry_delay_ms: u64,
    },
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for NotificationConfig {
    fn default() -> Self {
        NotificationConfig::Log
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub steps: StepsConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            schedule: ScheduleConfig::default(),
            retry: RetryConfig::default(),
            runner: RunnerConfig::default(),
            history: HistoryConfig::default(),
            server: ServerConfig::default(),
            steps: StepsConfig::default(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Config {
    /// Starter config written by `refresh init`: one command per data step.
    pub fn template() -> Self {
        let mut cfg = Self::default();
        for step in StepName::data_steps() {
            cfg.steps.set(
                *step,
                StepBackend::Command {
                    command: format!("./jobs/{step}"),
                    env: BTreeMap::new(),
                },
            );
        }
        cfg
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RefreshError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        crate::io::atomic_write(&path, self.to_yaml()?.as_bytes())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        // 1. Schedule must parse
        if let Err(e) = self.schedule.trigger() {
            error(format!("schedule.time: {e}"));
        }
        if let Err(e) = self.schedule.offset() {
            error(format!("schedule.utc_offset: {e}"));
        }

        // 2. Every data step needs a non-empty backend
        for step in StepName::data_steps() {
            let key = step.as_str().replace('-', "_");
            match self.steps.get(*step) {
                None => error(format!("steps.{key} is not configured")),
                Some(StepBackend::Command { command, .. }) if command.trim().is_empty() => {
                    error(format!("steps.{key} has an empty command"))
                }
                Some(StepBackend::Http { url, .. })
                    if !(url.starts_with("http://") || url.starts_with("https://")) =>
                {
                    error(format!("steps.{key} url '{url}' is not an http(s) URL"))
                }
                Some(_) => {}
            }
        }

        // 3. Telegram needs a chat id
        if let NotificationConfig::Telegram { chat_id, .. } = &self.notification {
            if chat_id.trim().is_empty() {
                error("notification.chat_id is empty".to_string());
            }
        }

        // 4. Timing values that would defeat the run itself
        if self.retry.enabled && self.retry.delay_seconds == 0 {
            error("retry.delay_seconds must be greater than 0 when retry is enabled".to_string());
        }
        if self.runner.max_step_seconds == Some(0) {
            error("runner.max_step_seconds must be greater than 0 (use null for no limit)".to_string());
        }

        // 5. Softer checks
        if let NotificationConfig::Telegram { bot_token_env, .. } = &self.notification {
            if std::env::var(bot_token_env).map(|v| v.is_empty()).unwrap_or(true) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "env var '{bot_token_env}' is not set; notifications will fail"
                    ),
                });
            }
        }
        match self.runner.max_step_seconds {
            None => warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "runner.max_step_seconds is unset; a hung step blocks the pipeline"
                    .to_string(),
            }),
            Some(secs) if secs > 6 * 3600 => warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!("runner.max_step_seconds={secs} (>6h is unusual)"),
            }),
            _ => {}
        }

        warnings
    }

    pub fn has_errors(&self) -> bool {
        self.validate().iter().any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
