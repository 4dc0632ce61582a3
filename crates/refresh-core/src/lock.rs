//! Cross-process exclusion for pipeline executions.
//!
//! The daemon and one-shot CLI runs hold `.refresh/lock.yaml` for as long as
//! they may execute steps. The record names its holder, so a second process
//! can refuse with a useful message, or forward to the daemon's control
//! surface when the record advertises a port. A record whose pid is gone is
//! stale and gets taken over. Exclusion does not depend on the history store
//! being enabled.

use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{RefreshError, Result};
use crate::io::{atomic_write, ensure_dir};
use crate::paths;

pub const DAEMON_HOLDER: &str = "daemon";
pub const MANUAL_HOLDER: &str = "manual run";

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub pid: u32,
    /// Control-surface port, set by a daemon once its listener is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_daemon(&self) -> bool {
        self.holder == DAEMON_HOLDER
    }

    pub fn control_url(&self) -> Option<String> {
        self.port.map(|port| format!("http://127.0.0.1:{port}"))
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.holder, self.pid)
    }
}

// ---------------------------------------------------------------------------
// ProcessLock
// ---------------------------------------------------------------------------

/// Held lock file; removed on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    record: LockRecord,
}

impl ProcessLock {
    /// Take the lock for this process, or fail with `Busy` naming the live
    /// holder.
    pub fn acquire(root: &Path, holder: &str) -> Result<Self> {
        let path = paths::lock_path(root);
        let record = LockRecord {
            holder: holder.to_string(),
            pid: std::process::id(),
            port: None,
            acquired_at: Utc::now(),
        };
        let data = serde_yaml::to_string(&record)?;

        // Second pass only after clearing a stale record.
        for _ in 0..2 {
            match create_new(&path, data.as_bytes()) {
                Ok(()) => {
                    debug!(holder, path = %path.display(), "process lock acquired");
                    return Ok(Self { path, record });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_record(&path)? {
                    Some(existing) if is_pid_alive(existing.pid) => {
                        return Err(RefreshError::Busy {
                            active: existing.to_string(),
                        })
                    }
                    stale => {
                        warn!(
                            stale = ?stale.map(|r| r.to_string()),
                            "removing stale process lock"
                        );
                        remove_if_present(&path)?;
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(RefreshError::Busy {
            active: "another process taking the lock".into(),
        })
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Advertise the control-surface port so other processes can forward.
    pub fn set_port(&mut self, port: u16) -> Result<()> {
        self.record.port = Some(port);
        let data = serde_yaml::to_string(&self.record)?;
        atomic_write(&self.path, data.as_bytes())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Only remove a record that is still ours.
        if let Ok(Some(current)) = read_record(&self.path) {
            if current == self.record {
                if let Err(e) = remove_if_present(&self.path) {
                    warn!(error = %e, "failed to release process lock");
                }
            }
        }
    }
}

/// The live holder of the lock under `root`, if any.
pub fn current_holder(root: &Path) -> Result<Option<LockRecord>> {
    Ok(read_record(&paths::lock_path(root))?.filter(|r| is_pid_alive(r.pid)))
}

fn create_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    ensure_dir(dir).map_err(std::io::Error::other)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

/// A missing or unreadable record reads as `None`.
fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_yaml::from_str(&data) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "ignoring malformed process lock");
            Ok(None)
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Returns true if the process is still alive (`kill -0 {pid}`).
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // No liveness check: a record is held until its owner removes it.
        let _ = pid;
        true
    }
}
