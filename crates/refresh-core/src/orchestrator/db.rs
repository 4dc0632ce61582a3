//! Persistent per-step run history using redb.
//!
//! # Table design
//!
//! A single `STEP_RUNS` table uses a 24-byte composite key:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | record uuid: 16 bytes ]
//! ```
//!
//! Because the timestamp occupies the high bytes in big-endian encoding,
//! byte ordering equals start-time ordering. Reverse iteration yields the
//! newest records first, and retention trims from the front.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{RefreshError, Result};

use super::record::{RunStatus, StepRunRecord};

/// Key: 24-byte composite (started_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded StepRunRecord
const STEP_RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("step_runs");

fn record_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn db_err(e: impl std::fmt::Display) -> RefreshError {
    RefreshError::History(e.to_string())
}

// ---------------------------------------------------------------------------
// HistoryDb
// ---------------------------------------------------------------------------

pub struct HistoryDb {
    db: Database,
}

impl HistoryDb {
    /// Open or create the redb database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = match Database::create(path) {
            Ok(db) => db,
            // redb holds an exclusive file lock for the life of the handle.
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                return Err(RefreshError::Busy {
                    active: "another process holding the history store".into(),
                })
            }
            Err(e) => return Err(db_err(e)),
        };
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(STEP_RUNS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert or replace a record. The key never changes over a record's
    /// lifetime, so the `Running` entry is overwritten in place on finish.
    pub fn put(&self, record: &StepRunRecord) -> Result<()> {
        let key = record_key(record.started_at, record.id);
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(STEP_RUNS).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Up to `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<StepRunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(STEP_RUNS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)?.rev().take(limit) {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// All records, oldest first.
    pub fn list_all(&self) -> Result<Vec<StepRunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(STEP_RUNS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// On daemon startup, mark any `Running` record older than `max_age` as
    /// `Failed`. Returns the number of records recovered.
    pub fn startup_recovery(&self, max_age: Duration) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(db_err)?;

        let mut count = 0u32;
        for mut record in self.list_all()? {
            if record.status == RunStatus::Running && record.updated_at < cutoff {
                record.status = RunStatus::Failed {
                    kind: None,
                    reason: "interrupted by restart".into(),
                };
                record.updated_at = Utc::now();
                self.put(&record)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Delete the oldest records so that at most `keep` remain.
    /// Returns the number of records removed.
    pub fn enforce_retention(&self, keep: usize) -> Result<usize> {
        let stale: Vec<Vec<u8>> = {
            let rt = self.db.begin_read().map_err(db_err)?;
            let table = rt.open_table(STEP_RUNS).map_err(db_err)?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                keys.push(k.value().to_vec());
            }
            let excess = keys.len().saturating_sub(keep);
            keys.truncate(excess);
            keys
        };
        if stale.is_empty() {
            return Ok(0);
        }

        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(STEP_RUNS).map_err(db_err)?;
            for key in &stale {
                table.remove(key.as_slice()).map_err(db_err)?;
            }
        }
        wt.commit().map_err(db_err)?;
        Ok(stale.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepError, StepResult};
    use crate::types::{StepName, Trigger};
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, HistoryDb) {
        let dir = TempDir::new().unwrap();
        let db = HistoryDb::open(&dir.path().join("history.redb")).unwrap();
        (dir, db)
    }

    fn record_at(step: StepName, started_at: DateTime<Utc>) -> StepRunRecord {
        let mut r = StepRunRecord::started(None, Trigger::Manual, step);
        r.started_at = started_at;
        r.updated_at = started_at;
        r
    }

    #[test]
    fn second_open_of_held_store_is_busy() {
        let (dir, _held) = open_tmp();
        let err = HistoryDb::open(&dir.path().join("history.redb")).err().unwrap();
        assert!(matches!(err, RefreshError::Busy { .. }), "{err:?}");
        assert!(err.to_string().starts_with("pipeline busy"));
    }

    #[test]
    fn put_then_finish_overwrites_running_entry() {
        let (_dir, db) = open_tmp();
        let mut record = StepRunRecord::started(Some(Uuid::new_v4()), Trigger::Scheduled, StepName::DealsUpdate);
        db.put(&record).unwrap();

        let t = record.started_at;
        let result = StepResult::from_outcome(
            StepName::DealsUpdate,
            t,
            t + CDur::seconds(1),
            Err(StepError::transport("timeout talking to broker")),
        );
        record.finish(&result);
        db.put(&record).unwrap();

        let all = db.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status.label(), "failed");
    }

    #[test]
    fn recent_returns_newest_first() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        db.put(&record_at(StepName::BalanceUpdate, now - CDur::seconds(30))).unwrap();
        db.put(&record_at(StepName::DealsUpdate, now - CDur::seconds(20))).unwrap();
        db.put(&record_at(StepName::UniverseUpdate, now - CDur::seconds(10))).unwrap();

        let recent = db.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].step, StepName::UniverseUpdate);
        assert_eq!(recent[1].step, StepName::DealsUpdate);
    }

    #[test]
    fn startup_recovery_marks_old_running_as_failed() {
        let (_dir, db) = open_tmp();
        let stale = record_at(StepName::WeightsUpdate, Utc::now() - CDur::minutes(10));
        db.put(&stale).unwrap();

        let recovered = db.startup_recovery(Duration::from_secs(120)).unwrap();
        assert_eq!(recovered, 1);

        let all = db.list_all().unwrap();
        match &all[0].status {
            RunStatus::Failed { reason, kind } => {
                assert!(reason.contains("restart"), "reason: {reason}");
                assert!(kind.is_none());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn startup_recovery_leaves_recent_running_alone() {
        let (_dir, db) = open_tmp();
        let fresh = StepRunRecord::started(None, Trigger::Manual, StepName::BalanceUpdate);
        db.put(&fresh).unwrap();

        let recovered = db.startup_recovery(Duration::from_secs(120)).unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(db.list_all().unwrap()[0].status, RunStatus::Running);
    }

    #[test]
    fn retention_drops_oldest_records() {
        let (_dir, db) = open_tmp();
        let now = Utc::now();
        for (i, step) in StepName::all().iter().enumerate() {
            db.put(&record_at(*step, now - CDur::seconds(100 - i as i64))).unwrap();
        }

        let removed = db.enforce_retention(2).unwrap();
        assert_eq!(removed, 3);
        let left: Vec<StepName> = db.list_all().unwrap().into_iter().map(|r| r.step).collect();
        assert_eq!(left, vec![StepName::WeightsUpdate, StepName::Notification]);

        assert_eq!(db.enforce_retention(10).unwrap(), 0);
    }

    #[test]
    fn empty_db_has_no_records() {
        let (_dir, db) = open_tmp();
        assert!(db.recent(10).unwrap().is_empty());
        assert_eq!(db.startup_recovery(Duration::from_secs(60)).unwrap(), 0);
    }
}
