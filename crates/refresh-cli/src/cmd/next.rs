use crate::output::print_json;
use anyhow::Context;
use chrono::{DateTime, Utc};
use refresh_core::config::Config;
use refresh_core::schedule::next_fire_after;
use std::path::Path;

pub fn run(root: &Path, now: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let trigger = config.schedule.trigger()?;
    let offset = config.schedule.offset()?;

    let now = match now {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid --now '{s}': expected RFC 3339"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    let next = next_fire_after(trigger, offset, now);
    let wait = next - now;

    if json {
        print_json(&serde_json::json!({
            "trigger_time": trigger,
            "utc_offset": offset.to_string(),
            "now": now,
            "next_fire_at": next,
            "next_fire_local": next.with_timezone(&offset).to_rfc3339(),
            "wait_seconds": wait.num_seconds(),
        }))?;
    } else {
        println!(
            "Next run: {} ({} UTC{}), in {}h {:02}m",
            next.with_timezone(&offset).format("%Y-%m-%d %H:%M"),
            trigger,
            offset,
            wait.num_hours(),
            wait.num_minutes() % 60
        );
    }
    Ok(())
}
