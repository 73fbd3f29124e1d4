//! Durable set of seen event fingerprints, backed by [`redb`].
//!
//! One table maps `fingerprint (64-hex) → first_seen (µs since epoch)`.
//! `first_sighting` is the at-most-once gate for ingress: the check and
//! the insert share one write transaction, and redb serializes writers,
//! so concurrent sightings of the same fingerprint cannot both win.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use kira_core::error::{KiraError, Result};
use kira_core::now_utc;

/// `fingerprint → first_seen_ts` (microseconds since the epoch).
const SEEN_TABLE: TableDefinition<&str, i64> = TableDefinition::new("seen");

pub struct IdempotencyStore {
    db: Database,
    path: PathBuf,
}

impl IdempotencyStore {
    /// Open or create the store at `path` (conventionally
    /// `{vault_root}/.state/idempotency.db`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path).map_err(storage_err)?;
        {
            let tx = db.begin_write().map_err(storage_err)?;
            tx.open_table(SEEN_TABLE).map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
        }
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff `fingerprint` has never been seen; records it on first
    /// sighting.
    pub fn first_sighting(&self, fingerprint: &str) -> Result<bool> {
        let tx = self.db.begin_write().map_err(storage_err)?;
        let fresh = {
            let mut table = tx.open_table(SEEN_TABLE).map_err(storage_err)?;
            let seen = table.get(fingerprint).map_err(storage_err)?.is_some();
            if !seen {
                table
                    .insert(fingerprint, now_utc().timestamp_micros())
                    .map_err(storage_err)?;
            }
            !seen
        };
        tx.commit().map_err(storage_err)?;
        Ok(fresh)
    }

    /// When a fingerprint was first seen, if ever.
    pub fn first_seen(&self, fingerprint: &str) -> Result<Option<DateTime<Utc>>> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(SEEN_TABLE).map_err(storage_err)?;
        let micros = table
            .get(fingerprint)
            .map_err(storage_err)?
            .map(|v| v.value());
        Ok(micros.and_then(DateTime::from_timestamp_micros))
    }

    /// Bulk-delete fingerprints first seen before `cutoff`; returns how
    /// many were removed.  Driven by the scheduler's TTL job.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_micros = cutoff.timestamp_micros();
        let tx = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = tx.open_table(SEEN_TABLE).map_err(storage_err)?;
            let stale: Vec<String> = table
                .iter()
                .map_err(storage_err)?
                .filter_map(|row| row.ok())
                .filter(|(_, ts)| ts.value() < cutoff_micros)
                .map(|(fp, _)| fp.value().to_string())
                .collect();
            for fingerprint in &stale {
                table.remove(fingerprint.as_str()).map_err(storage_err)?;
            }
            stale.len()
        };
        tx.commit().map_err(storage_err)?;
        if removed > 0 {
            tracing::info!(removed, path = %self.path.display(), "idempotency TTL purge");
        }
        Ok(removed)
    }

    /// Reclaim free pages after a purge.
    pub fn compact(&mut self) -> Result<bool> {
        self.db.compact().map_err(storage_err)
    }

    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(SEEN_TABLE).map_err(storage_err)?;
        Ok(table.len().map_err(storage_err)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn storage_err(err: impl std::fmt::Display) -> KiraError {
    KiraError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, IdempotencyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IdempotencyStore::open(dir.path().join("idempotency.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn first_sighting_flips_after_insert() {
        let (_dir, store) = store();
        assert!(store.first_sighting("aa").unwrap());
        assert!(!store.first_sighting("aa").unwrap());
        assert!(store.first_sighting("bb").unwrap());
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn sightings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.db");
        {
            let store = IdempotencyStore::open(&path).unwrap();
            assert!(store.first_sighting("cc").unwrap());
        }
        let store = IdempotencyStore::open(&path).unwrap();
        assert!(!store.first_sighting("cc").unwrap());
    }

    #[test]
    fn purge_removes_only_stale_rows() {
        let (_dir, store) = store();
        store.first_sighting("old").unwrap();
        store.first_sighting("new").unwrap();
        // Everything is newer than a cutoff in the past.
        let removed = store
            .purge_older_than(now_utc() - chrono::Duration::days(30))
            .unwrap();
        assert_eq!(removed, 0);
        // A future cutoff removes all rows.
        let removed = store
            .purge_older_than(now_utc() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty().unwrap());
        // Purged fingerprints count as fresh again.
        assert!(store.first_sighting("old").unwrap());
    }

    #[test]
    fn first_seen_is_recorded() {
        let (_dir, store) = store();
        let before = now_utc() - chrono::Duration::seconds(1);
        store.first_sighting("dd").unwrap();
        let seen = store.first_seen("dd").unwrap().unwrap();
        assert!(seen >= before);
        assert!(store.first_seen("absent").unwrap().is_none());
    }
}
