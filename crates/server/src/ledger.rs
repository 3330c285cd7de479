//! Event ledger: deduplicated request history with JSON snapshots.

use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use waffle_core::{EventFields, EventRecord};
use waffle_registry::{RegistryError, SnapshotStore, timestamped_name};

/// Name of a backup taken without an explicit name.
pub const DEFAULT_BACKUP_NAME: &str = "manual-backup";
/// Snapshot restored at startup; written by the scheduler every hour.
pub const HOURLY_BACKUP_NAME: &str = "hourly";

const SNAPSHOT_PREFIX: &str = "events-";
const PRE_RESET_BACKUP_NAME: &str = "pre-reset";

/// Scheduled backups as `(name, every n ticks)`.
const SCHEDULE: [(&str, u64); 4] = [
    (HOURLY_BACKUP_NAME, 1),
    ("daily", 24),
    ("weekly", 24 * 7),
    ("monthly", 24 * 30),
];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid backup name {0:?}: use lowercase letters, digits, '-' and '_'")]
    InvalidName(String),

    #[error("backup {0} not found")]
    NotFound(String),

    #[error("another backup is in progress")]
    Busy,

    #[error("snapshot error: {0}")]
    Snapshot(#[from] RegistryError),
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Result of a backup request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupOutcome {
    Written { name: String, path: PathBuf },
    /// An overlapping backup held the lock.
    Skipped,
}

/// MD5 hex digest of the request-identifying fields.
pub fn fingerprint(fields: &EventFields) -> String {
    let mut hasher = Md5::new();
    hasher.update(fields.identity().join(" ").as_bytes());
    hex::encode(hasher.finalize())
}

/// Backup names accepted from URLs.
pub fn validate_backup_name(name: &str) -> LedgerResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidName(name.to_string()))
    }
}

fn describe(fields: &EventFields) -> String {
    let branch = if fields.branch.is_empty() {
        String::new()
    } else {
        format!("/{}", fields.branch)
    };
    if fields.asset.is_empty() {
        let query = if fields.query_string.is_empty() {
            String::new()
        } else {
            format!("?{}", fields.query_string)
        };
        format!("{}{branch}{query}", fields.dataset_slug)
    } else {
        format!("{}{branch}/assets/{}", fields.dataset_slug, fields.asset)
    }
}

/// In-memory ledger keyed by [`fingerprint`].
pub struct EventLedger {
    records: Mutex<HashMap<String, EventRecord>>,
    snapshots: SnapshotStore,
    backup_lock: tokio::sync::Mutex<()>,
}

impl EventLedger {
    pub fn new(snapshots: SnapshotStore) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            snapshots,
            backup_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, EventRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one request. Returns the occurrence count of its fingerprint.
    pub fn record(&self, fields: EventFields) -> u64 {
        let key = fingerprint(&fields);
        let now = OffsetDateTime::now_utc();
        let mut records = self.records();

        if let Some(record) = records.get_mut(&key) {
            record.repeat(fields.timing_ms, now);
            tracing::debug!(
                count = record.count,
                status = fields.status,
                "FAMILIAR EVENT: {}",
                fields.comment
            );
            return record.count;
        }

        let line = describe(&fields);
        if fields.is_ok_outcome() {
            tracing::info!(
                kind = %fields.kind,
                status = fields.status,
                referer = %fields.referer,
                "NEW EVENT: {} --- {line}",
                fields.comment
            );
        } else {
            tracing::error!(
                kind = %fields.kind,
                status = fields.status,
                referer = %fields.referer,
                "NEW EVENT: {} --- {line}",
                fields.comment
            );
        }
        records.insert(key, EventRecord::first(fields, now));
        crate::metrics::LEDGER_RECORDS.set(records.len() as i64);
        1
    }

    /// Every record, oldest first.
    pub fn retrieve_all(&self) -> Vec<EventRecord> {
        let mut all: Vec<EventRecord> = self.records().values().cloned().collect();
        all.sort_by(|a, b| a.earliest.cmp(&b.earliest));
        all
    }

    /// The record with the same request fields, if any.
    pub fn retrieve_one(&self, fields: &EventFields) -> Option<EventRecord> {
        self.records().get(&fingerprint(fields)).cloned()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the whole table to `events-{name}`, optionally suffixed with the
    /// current time. Overlapping backups are skipped.
    pub async fn backup(&self, name: &str, timestamped: bool) -> LedgerResult<BackupOutcome> {
        validate_backup_name(name)?;
        let Ok(_guard) = self.backup_lock.try_lock() else {
            tracing::warn!(name, "Backup already in progress, skipping");
            return Ok(BackupOutcome::Skipped);
        };
        self.write_snapshot(name, timestamped).await
    }

    async fn write_snapshot(&self, name: &str, timestamped: bool) -> LedgerResult<BackupOutcome> {
        let name = if timestamped {
            timestamped_name(name, OffsetDateTime::now_utc())
        } else {
            name.to_string()
        };
        let records = self.retrieve_all();
        self.write_records(name, &records).await
    }

    async fn write_records<T: Serialize>(
        &self,
        name: String,
        records: &[T],
    ) -> LedgerResult<BackupOutcome> {
        let path = self
            .snapshots
            .write_json(&format!("{SNAPSHOT_PREFIX}{name}"), records)
            .await?;
        tracing::info!(name = %name, records = records.len(), path = %path.display(), "Events backed up");
        Ok(BackupOutcome::Written { name, path })
    }

    /// Replace the table with the backup `name`. Returns the number of records loaded.
    pub async fn restore(&self, name: &str) -> LedgerResult<usize> {
        let records: Vec<EventRecord> = self
            .snapshots
            .read_json(&format!("{SNAPSHOT_PREFIX}{name}"))
            .await?
            .ok_or_else(|| LedgerError::NotFound(name.to_string()))?;

        let table: HashMap<String, EventRecord> = records
            .into_iter()
            .map(|record| (fingerprint(&record.fields), record))
            .collect();
        let count = table.len();
        *self.records() = table;
        crate::metrics::LEDGER_RECORDS.set(count as i64);
        tracing::info!(name, records = count, "Events restored");
        Ok(count)
    }

    /// Clear the table after a timestamped `pre-reset` backup.
    ///
    /// The table is taken out before the backup is written, so events recorded
    /// meanwhile land in the fresh table. If the backup fails the taken
    /// records are merged back and nothing is lost.
    pub async fn reset(&self) -> LedgerResult<BackupOutcome> {
        let Ok(_guard) = self.backup_lock.try_lock() else {
            return Err(LedgerError::Busy);
        };
        let name = timestamped_name(PRE_RESET_BACKUP_NAME, OffsetDateTime::now_utc());
        let taken = std::mem::take(&mut *self.records());
        crate::metrics::LEDGER_RECORDS.set(self.len() as i64);

        let mut oldest_first: Vec<&EventRecord> = taken.values().collect();
        oldest_first.sort_by(|a, b| a.earliest.cmp(&b.earliest));
        match self.write_records(name, &oldest_first).await {
            Ok(outcome) => {
                tracing::info!(records = taken.len(), "Events reset");
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(error = %e, "Pre-reset backup failed, keeping events");
                self.merge_back(taken);
                Err(e)
            }
        }
    }

    /// Return records taken out of the table, folding in repeats recorded since.
    fn merge_back(&self, taken: HashMap<String, EventRecord>) {
        let mut records = self.records();
        for (key, older) in taken {
            match records.entry(key) {
                Entry::Occupied(mut newer) => newer.get_mut().merge(older),
                Entry::Vacant(slot) => {
                    slot.insert(older);
                }
            }
        }
        crate::metrics::LEDGER_RECORDS.set(records.len() as i64);
    }

    /// Back up under the fixed schedule names every `period`.
    pub fn spawn_scheduler(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            let mut ticks: u64 = 0;
            loop {
                interval.tick().await;
                ticks += 1;
                for (name, every) in SCHEDULE {
                    if ticks % every != 0 {
                        continue;
                    }
                    if let Err(e) = self.backup(name, false).await {
                        tracing::error!(name, error = %e, "Scheduled event backup failed");
                    }
                }
            }
        })
    }
}
