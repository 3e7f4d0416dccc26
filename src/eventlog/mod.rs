//! Event log — append-only heal and recovery outcome records.
//!
//! Two sled trees keyed by big-endian timestamp (plus a per-process
//! counter for uniqueness), so iteration order is chronological and every
//! append is atomic per record. Records are write-once: nothing in this
//! module mutates or deletes. The external reporting collaborator reads
//! these streams for trend display; an unreadable record is surfaced as a
//! corruption error, never silently skipped or retried.

use crate::supervisor::patterns::PatternSeverity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one deep-scan remedy attempt. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealEvent {
    pub timestamp: DateTime<Utc>,
    pub daemon: String,
    pub pattern_id: String,
    pub remedy_applied: String,
    pub success: bool,
    pub duration_ms: u64,
    pub severity: PatternSeverity,
}

/// Outcome of one fast watchdog restart. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub timestamp: DateTime<Utc>,
    pub daemon: String,
    pub strategy: String,
    pub attempts: u32,
    pub time_to_recover_ms: u64,
    pub success: bool,
}

/// Aggregate recovery-rate statistics for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    pub heal_total: u64,
    pub heal_succeeded: u64,
    pub heal_success_rate: f64,
    pub recovery_total: u64,
    pub recovery_succeeded: u64,
    pub recovery_success_rate: f64,
    pub mean_time_to_recover_ms: Option<f64>,
}

/// Event log errors. `Corrupt` is health-critical for the whole stack.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log database error: {0}")]
    Database(#[from] sled::Error),

    #[error("event log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt event log record at key {key_hex}: {reason}")]
    Corrupt { key_hex: String, reason: String },
}

/// Append-only persisted record of heal and recovery outcomes.
pub struct EventLog {
    _db: sled::Db,
    heal: sled::Tree,
    recovery: sled::Tree,
    /// Disambiguates records appended within the same nanosecond.
    counter: AtomicU64,
}

impl EventLog {
    /// Open or create the event log at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EventLogError> {
        let db = sled::open(path.as_ref())?;
        let heal = db.open_tree("heal_events")?;
        let recovery = db.open_tree("recovery_events")?;
        tracing::info!(path = %path.as_ref().display(), "Event log opened");
        Ok(Self {
            _db: db,
            heal,
            recovery,
            counter: AtomicU64::new(0),
        })
    }

    fn key_for(&self, timestamp: &DateTime<Utc>) -> [u8; 16] {
        let nanos = timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| timestamp.timestamp_micros().saturating_mul(1_000))
            as u64;
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&nanos.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        key
    }

    /// Append a heal outcome. Atomic per record.
    pub fn append_heal(&self, event: &HealEvent) -> Result<(), EventLogError> {
        let key = self.key_for(&event.timestamp);
        let value = serde_json::to_vec(event)?;
        self.heal.insert(key, value)?;
        Ok(())
    }

    /// Append a recovery outcome. Atomic per record.
    pub fn append_recovery(&self, event: &RecoveryEvent) -> Result<(), EventLogError> {
        let key = self.key_for(&event.timestamp);
        let value = serde_json::to_vec(event)?;
        self.recovery.insert(key, value)?;
        Ok(())
    }

    /// Most recent heal events, newest first.
    pub fn recent_heal(&self, limit: usize) -> Result<Vec<HealEvent>, EventLogError> {
        Self::read_recent(&self.heal, limit)
    }

    /// Most recent recovery events, newest first.
    pub fn recent_recovery(&self, limit: usize) -> Result<Vec<RecoveryEvent>, EventLogError> {
        Self::read_recent(&self.recovery, limit)
    }

    fn read_recent<T: serde::de::DeserializeOwned>(
        tree: &sled::Tree,
        limit: usize,
    ) -> Result<Vec<T>, EventLogError> {
        let mut out = Vec::with_capacity(limit.min(256));
        for item in tree.iter().rev().take(limit) {
            let (key, value) = item?;
            let record =
                serde_json::from_slice(&value).map_err(|e| EventLogError::Corrupt {
                    key_hex: hex(&key),
                    reason: e.to_string(),
                })?;
            out.push(record);
        }
        Ok(out)
    }

    /// Aggregate statistics over the most recent records of each stream.
    ///
    /// Bounded to the last 500 records per stream so the health endpoint
    /// stays cheap regardless of log size.
    pub fn recovery_stats(&self) -> Result<RecoveryStats, EventLogError> {
        const WINDOW: usize = 500;

        let heals = self.recent_heal(WINDOW)?;
        let recoveries = self.recent_recovery(WINDOW)?;

        let heal_total = heals.len() as u64;
        let heal_succeeded = heals.iter().filter(|e| e.success).count() as u64;
        let recovery_total = recoveries.len() as u64;
        let recovery_succeeded = recoveries.iter().filter(|e| e.success).count() as u64;

        let successful_recover_times: Vec<u64> = recoveries
            .iter()
            .filter(|e| e.success)
            .map(|e| e.time_to_recover_ms)
            .collect();
        let mean_time_to_recover_ms = if successful_recover_times.is_empty() {
            None
        } else {
            Some(
                successful_recover_times.iter().sum::<u64>() as f64
                    / successful_recover_times.len() as f64,
            )
        };

        Ok(RecoveryStats {
            heal_total,
            heal_succeeded,
            heal_success_rate: rate(heal_succeeded, heal_total),
            recovery_total,
            recovery_succeeded,
            recovery_success_rate: rate(recovery_succeeded, recovery_total),
            mean_time_to_recover_ms,
        })
    }
}

fn rate(succeeded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        succeeded as f64 / total as f64
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn heal_event(daemon: &str, success: bool) -> HealEvent {
        HealEvent {
            timestamp: Utc::now(),
            daemon: daemon.to_string(),
            pattern_id: "stale_lock".to_string(),
            remedy_applied: "clear_stale_lock".to_string(),
            success,
            duration_ms: 42,
            severity: PatternSeverity::High,
        }
    }

    fn recovery_event(daemon: &str, success: bool, ttr: u64) -> RecoveryEvent {
        RecoveryEvent {
            timestamp: Utc::now(),
            daemon: daemon.to_string(),
            strategy: "restart".to_string(),
            attempts: 1,
            time_to_recover_ms: ttr,
            success,
        }
    }

    #[test]
    fn append_and_read_back_in_reverse_chronological_order() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.append_heal(&heal_event("sync", true)).unwrap();
        log.append_heal(&heal_event("exporter", false)).unwrap();

        let events = log.recent_heal(10).unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].daemon, "exporter");
        assert_eq!(events[1].daemon, "sync");
    }

    #[test]
    fn same_timestamp_appends_do_not_collide() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        let ts = Utc::now();
        for i in 0..10 {
            let mut event = recovery_event("exporter", true, i);
            event.timestamp = ts;
            log.append_recovery(&event).unwrap();
        }
        assert_eq!(log.recent_recovery(100).unwrap().len(), 10);
    }

    #[test]
    fn stats_aggregate_both_streams() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.append_heal(&heal_event("sync", true)).unwrap();
        log.append_heal(&heal_event("sync", false)).unwrap();
        log.append_recovery(&recovery_event("exporter", true, 100))
            .unwrap();
        log.append_recovery(&recovery_event("exporter", true, 300))
            .unwrap();
        log.append_recovery(&recovery_event("exporter", false, 0))
            .unwrap();

        let stats = log.recovery_stats().unwrap();
        assert_eq!(stats.heal_total, 2);
        assert_eq!(stats.heal_succeeded, 1);
        assert!((stats.heal_success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.recovery_total, 3);
        assert_eq!(stats.recovery_succeeded, 2);
        assert_eq!(stats.mean_time_to_recover_ms, Some(200.0));
    }

    #[test]
    fn corrupt_record_is_an_error_not_a_skip() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.append_heal(&heal_event("sync", true)).unwrap();
        log.heal.insert([0xffu8; 16], &b"not json"[..]).unwrap();

        let err = log.recent_heal(10).unwrap_err();
        assert!(matches!(err, EventLogError::Corrupt { .. }));
    }

    #[test]
    fn empty_log_yields_zeroed_stats() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();
        let stats = log.recovery_stats().unwrap();
        assert_eq!(stats.heal_total, 0);
        assert_eq!(stats.recovery_success_rate, 0.0);
        assert!(stats.mean_time_to_recover_ms.is_none());
    }
}
