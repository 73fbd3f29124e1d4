//! The sync ledger: per-remote-id bookkeeping for two-way mirroring.
//!
//! One [`redb`] table keyed by `(source, remote_id)` holds the last
//! remote version/etag this side has seen, when it last synced, and the
//! last write instants on both sides.  The ledger is authoritative for
//! echo detection.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use kira_core::error::{KiraError, Result};

/// `"{source}\u{1f}{remote_id}" → JSON LedgerEntry`.
const LEDGER_TABLE: TableDefinition<&str, &str> = TableDefinition::new("ledger");

const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_ts_local: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_ts_remote: Option<DateTime<Utc>>,
}

pub struct SyncLedger {
    db: Database,
    path: PathBuf,
}

impl SyncLedger {
    /// Open or create the ledger (conventionally
    /// `{vault_root}/.state/sync_ledger.db`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path).map_err(storage_err)?;
        {
            let tx = db.begin_write().map_err(storage_err)?;
            tx.open_table(LEDGER_TABLE).map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
        }
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, source: &str, remote_id: &str) -> Result<Option<LedgerEntry>> {
        let key = ledger_key(source, remote_id);
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(LEDGER_TABLE).map_err(storage_err)?;
        match table.get(key.as_str()).map_err(storage_err)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw.value())
                .map(Some)
                .map_err(|err| KiraError::Storage(format!("corrupt ledger row {key}: {err}"))),
        }
    }

    pub fn put(&self, source: &str, remote_id: &str, entry: &LedgerEntry) -> Result<()> {
        let key = ledger_key(source, remote_id);
        let rendered = serde_json::to_string(entry).map_err(storage_err)?;
        let tx = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = tx.open_table(LEDGER_TABLE).map_err(storage_err)?;
            table
                .insert(key.as_str(), rendered.as_str())
                .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(())
    }

    pub fn remove(&self, source: &str, remote_id: &str) -> Result<bool> {
        let key = ledger_key(source, remote_id);
        let tx = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = tx.open_table(LEDGER_TABLE).map_err(storage_err)?;
            table.remove(key.as_str()).map_err(storage_err)?.is_some()
        };
        tx.commit().map_err(storage_err)?;
        Ok(removed)
    }

    /// Every row, as `((source, remote_id), entry)`.
    pub fn all(&self) -> Result<Vec<((String, String), LedgerEntry)>> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(LEDGER_TABLE).map_err(storage_err)?;
        let mut rows = Vec::new();
        for item in table.iter().map_err(storage_err)? {
            let (key, value) = item.map_err(storage_err)?;
            let key = key.value();
            let Some((source, remote_id)) = key.split_once(KEY_SEPARATOR) else {
                tracing::warn!(key, "malformed ledger key skipped");
                continue;
            };
            match serde_json::from_str::<LedgerEntry>(value.value()) {
                Ok(entry) => rows.push(((source.to_string(), remote_id.to_string()), entry)),
                Err(err) => tracing::warn!(key, error = %err, "corrupt ledger row skipped"),
            }
        }
        Ok(rows)
    }

    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read().map_err(storage_err)?;
        let table = tx.open_table(LEDGER_TABLE).map_err(storage_err)?;
        Ok(table.len().map_err(storage_err)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn compact(&mut self) -> Result<bool> {
        self.db.compact().map_err(storage_err)
    }
}

fn ledger_key(source: &str, remote_id: &str) -> String {
    format!("{source}{KEY_SEPARATOR}{remote_id}")
}

fn storage_err(err: impl std::fmt::Display) -> KiraError {
    KiraError::Storage(err.to_string())
}
