//! Two-way reconciliation between the vault and a remote calendar.
//!
//! Pull: fetch remote changes, drop echoes of our own pushes, resolve
//! conflicts latest-wins, and import through the Host with the
//! sync-origin flag set so the resulting post-write events are never
//! pushed back out.  Push: send locally modified mirrored entities and
//! record the ack in the ledger before the next pull, which is what
//! prevents self-echo.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use kira_core::error::{KiraError, Result};
use kira_core::{ConflictWinner, Entity, EntityState, Envelope, Header, Kind, SyncMeta, new_trace_id};
use kira_vault::{AuditTrail, Host, WriteOptions};

use crate::ledger::{LedgerEntry, SyncLedger};
use crate::provider::{CalendarProvider, RemoteChange};

/// Tie-break rank of the local side; remotes configure theirs in
/// `[sync] source_priority` (lower wins, local defaults to winning).
const LOCAL_PRIORITY: u32 = 0;

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub source: String,
    pub source_priority: u32,
}

impl From<&kira_config::SyncConfig> for ReconcilerOptions {
    fn from(config: &kira_config::SyncConfig) -> Self {
        Self {
            source: config.source.clone(),
            source_priority: config.source_priority,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullSummary {
    pub imported: usize,
    pub echoes: usize,
    pub unchanged: usize,
    pub local_wins: usize,
    pub archived: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushSummary {
    pub pushed: usize,
    pub clean: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub pull: PullSummary,
    pub push: PushSummary,
}

/// True if the incoming change merely reflects what the ledger recorded
/// as last pushed/imported.  Comparison covers the fields the remote
/// actually supplied; a change carrying neither version nor etag can
/// never be an echo.
pub fn is_echo(entry: Option<&LedgerEntry>, version: Option<&str>, etag: Option<&str>) -> bool {
    let Some(entry) = entry else {
        return false;
    };
    let mut compared = false;
    if let Some(version) = version {
        if entry.version_seen.as_deref() != Some(version) {
            return false;
        }
        compared = true;
    }
    if let Some(etag) = etag {
        if entry.etag_seen.as_deref() != Some(etag) {
            return false;
        }
        compared = true;
    }
    compared
}

/// True if the remote has advanced beyond the recorded state.
pub fn should_import(entry: Option<&LedgerEntry>, version: Option<&str>, etag: Option<&str>) -> bool {
    let Some(entry) = entry else {
        return true;
    };
    match (version, etag) {
        (None, None) => true,
        _ => {
            version.is_some_and(|v| entry.version_seen.as_deref() != Some(v))
                || etag.is_some_and(|e| entry.etag_seen.as_deref() != Some(e))
        }
    }
}

/// Latest-wins conflict resolution; equal instants fall back to the
/// lexicographically smaller `(priority, id)` tuple.
pub fn resolve(
    local_last_write: DateTime<Utc>,
    remote_last_write: DateTime<Utc>,
    local_id: &str,
    remote_id: &str,
    remote_priority: u32,
) -> ConflictWinner {
    match local_last_write.cmp(&remote_last_write) {
        std::cmp::Ordering::Greater => ConflictWinner::Local,
        std::cmp::Ordering::Less => ConflictWinner::Remote,
        std::cmp::Ordering::Equal => {
            if (LOCAL_PRIORITY, local_id) <= (remote_priority, remote_id) {
                ConflictWinner::Tie
            } else {
                ConflictWinner::Remote
            }
        }
    }
}

pub struct Reconciler {
    host: Arc<Host>,
    ledger: Arc<SyncLedger>,
    provider: Arc<dyn CalendarProvider>,
    audit: AuditTrail,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        host: Arc<Host>,
        ledger: Arc<SyncLedger>,
        provider: Arc<dyn CalendarProvider>,
        audit: AuditTrail,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            host,
            ledger,
            provider,
            audit,
            options,
        }
    }

    /// One full sync cycle: pull first, then push.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let pull = self.pull().await?;
        let push = self.push().await?;
        Ok(CycleSummary { pull, push })
    }

    /// Whether a post-write event should schedule a push.  Imports are
    /// flagged `sync_origin` and must not bounce back to the remote.
    pub fn wants_push(&self, envelope: &Envelope) -> bool {
        !envelope.sync_origin
    }

    pub async fn pull(&self) -> Result<PullSummary> {
        let changes = self.provider.pull().await.map_err(|err| KiraError::Remote {
            source_name: self.options.source.clone(),
            message: err.to_string(),
        })?;

        let mut summary = PullSummary::default();
        for change in changes {
            self.apply_remote_change(change, &mut summary)?;
        }
        Ok(summary)
    }

    fn apply_remote_change(&self, change: RemoteChange, summary: &mut PullSummary) -> Result<()> {
        let trace = new_trace_id();
        let source = &self.options.source;
        let entry = self.ledger.get(source, &change.remote_id)?;

        if is_echo(entry.as_ref(), change.version.as_deref(), change.etag.as_deref()) {
            summary.echoes += 1;
            self.audit
                .note("sync.pull", Some(&change.remote_id), &trace, "echo_suppressed");
            return Ok(());
        }
        if !should_import(entry.as_ref(), change.version.as_deref(), change.etag.as_deref()) {
            summary.unchanged += 1;
            return Ok(());
        }

        let local = entry
            .as_ref()
            .and_then(|e| self.host.read(&e.entity_id).ok());

        if change.deleted {
            // Remote deletions archive locally; the vault file is the
            // durable record and is never destroyed from a pull.
            if let Some(local) = &local {
                if local.header.state == EntityState::Active {
                    let opts = WriteOptions {
                        trace_id: Some(trace.clone()),
                        sync_origin: true,
                        now: None,
                    };
                    self.host
                        .transition(local.id(), EntityState::Archived, None, &opts)?;
                }
            }
            self.ledger.remove(source, &change.remote_id)?;
            summary.archived += 1;
            self.audit
                .note("sync.pull", Some(&change.remote_id), &trace, "remote_deleted");
            return Ok(());
        }

        if let Some(local) = &local {
            let winner = resolve(
                local.header.updated_ts,
                change.last_modified,
                local.id(),
                &change.remote_id,
                self.options.source_priority,
            );
            if winner != ConflictWinner::Remote {
                // Local wins: keep our copy, but record what we observed
                // so the same remote revision is not offered again.
                summary.local_wins += 1;
                let mut entry = entry.unwrap_or(LedgerEntry {
                    entity_id: local.id().to_string(),
                    version_seen: None,
                    etag_seen: None,
                    last_sync_ts: None,
                    last_write_ts_local: None,
                    last_write_ts_remote: None,
                });
                entry.version_seen = change.version.clone();
                entry.etag_seen = change.etag.clone();
                entry.last_write_ts_remote = Some(change.last_modified);
                self.ledger.put(source, &change.remote_id, &entry)?;
                self.audit
                    .note("sync.pull", Some(local.id()), &trace, "conflict_local_won");
                return Ok(());
            }
            self.audit
                .note("sync.pull", Some(local.id()), &trace, "conflict_remote_won");
        }

        let imported = self.import(&change, local.as_ref(), &trace)?;
        self.ledger.put(
            source,
            &change.remote_id,
            &LedgerEntry {
                entity_id: imported.header.id.clone(),
                version_seen: change.version.clone(),
                etag_seen: change.etag.clone(),
                last_sync_ts: Some(imported.header.updated_ts),
                last_write_ts_local: Some(imported.header.updated_ts),
                last_write_ts_remote: Some(change.last_modified),
            },
        )?;
        summary.imported += 1;
        Ok(())
    }

    fn import(&self, change: &RemoteChange, local: Option<&Entity>, trace: &str) -> Result<Entity> {
        let mut header = match local {
            Some(entity) => entity.header.clone(),
            None => Header::draft(Kind::Event, &change.title),
        };
        header.title = change.title.clone();
        header.start_ts = change.start_ts;
        header.end_ts = change.end_ts;
        header.location = change.location.clone();
        header.attendees = change.attendees.clone();
        header.sync = Some(SyncMeta {
            source: self.options.source.clone(),
            remote_id: change.remote_id.clone(),
            version_seen: change.version.clone(),
            etag_seen: change.etag.clone(),
            last_write_ts: Some(change.last_modified),
        });

        let opts = WriteOptions {
            trace_id: Some(trace.to_string()),
            sync_origin: true,
            now: None,
        };
        self.host.upsert(Kind::Event, header, &change.body, &opts)
    }

    pub async fn push(&self) -> Result<PushSummary> {
        let source = &self.options.source;
        let mirrored = self.host.list_filtered(None, |entity| {
            entity
                .header
                .sync
                .as_ref()
                .is_some_and(|meta| &meta.source == source)
        })?;

        let mut summary = PushSummary::default();
        for entity in mirrored {
            let Some(meta) = entity.header.sync.clone() else {
                continue;
            };
            let entry = self.ledger.get(source, &meta.remote_id)?;
            let dirty = entry
                .as_ref()
                .and_then(|e| e.last_sync_ts)
                .is_none_or(|ts| entity.header.updated_ts > ts);
            if !dirty {
                summary.clean += 1;
                continue;
            }

            let trace = new_trace_id();
            // A failure here leaves the ledger untouched; the caller's
            // retry policy re-runs the push with the same candidates.
            let ack = self
                .provider
                .push(&entity)
                .await
                .map_err(|err| KiraError::Remote {
                    source_name: source.clone(),
                    message: err.to_string(),
                })?;

            self.ledger.put(
                source,
                &meta.remote_id,
                &LedgerEntry {
                    entity_id: entity.header.id.clone(),
                    version_seen: ack.version.clone(),
                    etag_seen: ack.etag.clone(),
                    last_sync_ts: Some(kira_core::now_utc()),
                    last_write_ts_local: Some(entity.header.updated_ts),
                    last_write_ts_remote: entry.and_then(|e| e.last_write_ts_remote),
                },
            )?;
            self.audit
                .note("sync.push", Some(entity.id()), &trace, "ok");
            summary.pushed += 1;
        }
        Ok(summary)
    }

    /// Startup reconciliation: drop ledger rows whose entity no longer
    /// exists on disk.
    pub fn reconcile_startup(&self) -> Result<usize> {
        let mut dropped = 0;
        for ((source, remote_id), entry) in self.ledger.all()? {
            if source != self.options.source {
                continue;
            }
            if self.host.read(&entry.entity_id).is_err() {
                self.ledger.remove(&source, &remote_id)?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::info!(dropped, "sync ledger rows without entities dropped");
        }
        Ok(dropped)
    }
}
