//! Daily trigger computation and the cancellable wait.
//!
//! State machine: `Idle → Waiting → Fired → Idle …`, with `Stopped` as the
//! only terminal state. The wait is the single suspension point where
//! cancellation is observed. Missed days are never replayed: after a restart
//! the next fire is always the next future occurrence.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{RefreshError, Result};
use crate::notify::{deliver_alert, Alert, Notifier};

// ---------------------------------------------------------------------------
// DailyTrigger
// ---------------------------------------------------------------------------

/// A time of day (`HH:MM`) at which the pipeline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTrigger {
    hour: u32,
    minute: u32,
}

impl DailyTrigger {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(RefreshError::InvalidTriggerTime(format!(
                "{hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    fn as_naive(&self) -> NaiveTime {
        // Range checked in `new`.
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for DailyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for DailyTrigger {
    type Err = RefreshError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RefreshError::InvalidTriggerTime(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || m.len() != 2 {
            return Err(invalid());
        }
        let hour = clock_field(h).ok_or_else(invalid)?;
        let minute = clock_field(m).ok_or_else(invalid)?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

/// One or two ASCII digits. Rejects the signs `str::parse` would accept.
fn clock_field(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl Serialize for DailyTrigger {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DailyTrigger {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a fixed UTC offset written as `+HH:MM`, `-HH:MM`, or `Z`.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let invalid = || RefreshError::InvalidUtcOffset(s.to_string());
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(invalid()),
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "00"));
    let hours = clock_field(h).ok_or_else(invalid)?;
    let minutes = clock_field(m).ok_or_else(invalid)?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    let seconds = (hours * 3600 + minutes * 60) as i32;
    FixedOffset::east_opt(sign * seconds).ok_or_else(invalid)
}

/// The first instant strictly after `now` whose local time in `offset`
/// equals `trigger`. A trigger at or before `now` today rolls to tomorrow.
pub fn next_fire_after(
    trigger: DailyTrigger,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let local_now = now.with_timezone(&offset);
    let today = local_now.date_naive().and_time(trigger.as_naive());
    // A fixed offset has no gaps or folds, so the mapping is always single.
    let mut target = offset
        .from_local_datetime(&today)
        .single()
        .unwrap_or(local_now);
    if target <= local_now {
        target += chrono::Duration::days(1);
    }
    target.with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// ScheduleState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    Idle,
    Waiting,
    Fired,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleState {
    pub phase: SchedulePhase,
    pub configured_trigger_time: DailyTrigger,
    pub utc_offset: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Emitted when the configured instant is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub scheduled_for: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    trigger: DailyTrigger,
    offset: FixedOffset,
    heartbeat: Duration,
    last_fired_for: Option<DateTime<Utc>>,
    state_tx: watch::Sender<ScheduleState>,
    health_check: Option<HealthCheck>,
}

/// Heartbeats within `within` of the trigger are also sent to operators.
struct HealthCheck {
    notifier: Arc<dyn Notifier>,
    within: Duration,
}

impl Scheduler {
    pub fn new(trigger: DailyTrigger, offset: FixedOffset, heartbeat: Duration) -> Self {
        let state = ScheduleState {
            phase: SchedulePhase::Idle,
            configured_trigger_time: trigger,
            utc_offset: offset.to_string(),
            next_fire_at: None,
            last_fired_at: None,
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            trigger,
            offset,
            heartbeat: heartbeat.max(Duration::from_secs(1)),
            last_fired_for: None,
            state_tx,
            health_check: None,
        }
    }

    pub fn with_health_check(mut self, notifier: Arc<dyn Notifier>, within: Duration) -> Self {
        self.health_check = Some(HealthCheck { notifier, within });
        self
    }

    pub fn trigger(&self) -> DailyTrigger {
        self.trigger
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Subscribe to state changes (for the control surface).
    pub fn subscribe(&self) -> watch::Receiver<ScheduleState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ScheduleState {
        self.state_tx.borrow().clone()
    }

    /// Next fire instant as seen from `now`.
    ///
    /// Never returns the instant that already fired, even when the wall
    /// clock reads slightly earlier than it after waking.
    pub fn next_fire_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let from = match self.last_fired_for {
            Some(fired) => now.max(fired),
            None => now,
        };
        next_fire_after(self.trigger, self.offset, from)
    }

    /// Wait until the next trigger or until `cancel` flips to `true`.
    ///
    /// Returns `None` once cancelled; the scheduler is then `Stopped` and
    /// every later call returns `None` immediately. A dropped cancel sender
    /// counts as cancellation.
    pub async fn wait_for_next_trigger(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<TriggerEvent> {
        if self.state_tx.borrow().phase == SchedulePhase::Stopped || *cancel.borrow() {
            self.set_phase(SchedulePhase::Stopped, None);
            return None;
        }

        let now = Utc::now();
        let next = self.next_fire_at(now);
        self.set_phase(SchedulePhase::Waiting, Some(next));

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(
            next_fire_at = %next.with_timezone(&self.offset).to_rfc3339(),
            wait_secs = wait.as_secs(),
            "next pipeline run scheduled"
        );

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = remaining.min(self.heartbeat);
            tokio::select! {
                _ = tokio::time::sleep(chunk) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if !left.is_zero() {
                        let hours = left.as_secs_f64() / 3600.0;
                        info!(hours_remaining = hours, "scheduler heartbeat");
                        if let Some(check) = self.health_check.as_ref().filter(|c| left <= c.within) {
                            let alert = Alert::info(
                                "Pipeline Scheduler Health Check",
                                format!("Pipeline will run in {hours:.1} hours"),
                            );
                            deliver_alert(check.notifier.as_ref(), &alert).await;
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("scheduler cancelled while waiting");
                        self.set_phase(SchedulePhase::Stopped, None);
                        return None;
                    }
                    debug!("cancel signal changed but not set, still waiting");
                }
            }
        }

        let fired_at = Utc::now();
        self.last_fired_for = Some(next);
        self.state_tx.send_modify(|s| {
            s.phase = SchedulePhase::Fired;
            s.last_fired_at = Some(fired_at);
        });
        Some(TriggerEvent {
            scheduled_for: next,
            fired_at,
        })
    }

    /// Mark the post-fire work as done; the loop re-enters `Waiting` next.
    pub fn mark_idle(&self) {
        let next = self.next_fire_at(Utc::now());
        self.set_phase(SchedulePhase::Idle, Some(next));
    }

    fn set_phase(&self, phase: SchedulePhase, next_fire_at: Option<DateTime<Utc>>) {
        self.state_tx.send_modify(|s| {
            s.phase = phase;
            s.next_fire_at = next_fire_at;
        });
    }
}
