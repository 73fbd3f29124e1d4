//! Built-in bus handlers: chat/inbox ingestion, entity requests with
//! edit-before-create inversion, sync triggers, rollup generation, and
//! store maintenance.
//!
//! Delivery is at-least-once, so every handler here converges under
//! re-execution: writes go through `upsert` keyed by a deterministic id.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono_tz::Tz;

use kira_core::envelope::types;
use kira_core::error::{KiraError, Result};
use kira_core::{EntityState, Envelope, Header, Kind, now_utc, slugify};
use kira_events::{EventHandler, IdempotencyStore};
use kira_rollup::{RollupEngine, render_markdown};
use kira_sync::Reconciler;
use kira_vault::{HeaderPatch, Host, WriteOptions, atomic_write};

/// Chat and inbox text: a leading `TODO:`/`task:` marker makes a Task,
/// anything else becomes a Note titled by its first line.
pub struct MessageHandler {
    host: Arc<Host>,
}

impl MessageHandler {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl EventHandler for MessageHandler {
    fn name(&self) -> &str {
        "message-ingest"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope
            .payload
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim();
        if text.is_empty() {
            tracing::debug!(event_id = %envelope.event_id, "empty message ignored");
            return Ok(());
        }

        let (kind, title) = classify_message(text);
        // Deterministic id: redelivery of the same envelope upserts the
        // same entity instead of minting a sibling.
        let mut header = Header::draft(kind, &title);
        header.id = format!(
            "{}-{}-{}",
            kind.slug(),
            envelope.event_ts.format("%Y%m%d-%H%M"),
            slugify(&title)
        );
        let body = if kind == Kind::Note { text } else { "" };

        let opts = WriteOptions {
            trace_id: Some(envelope.trace_id.clone()),
            sync_origin: false,
            now: Some(envelope.event_ts),
        };
        self.host.upsert(kind, header, body, &opts)?;
        Ok(())
    }
}

pub fn classify_message(text: &str) -> (Kind, String) {
    for marker in ["TODO:", "todo:", "Task:", "task:"] {
        if let Some(rest) = text.strip_prefix(marker) {
            let title = rest.trim();
            if !title.is_empty() {
                return (Kind::Task, title.to_string());
            }
        }
    }
    let first_line = text.lines().next().unwrap_or(text).trim();
    let mut title = first_line.to_string();
    if title.len() > 80 {
        let mut cut = 80;
        while cut > 0 && !title.is_char_boundary(cut) {
            cut -= 1;
        }
        title.truncate(cut);
    }
    (Kind::Note, title)
}

/// Structured entity requests.  `entity.update_requested` for a missing
/// id creates the entity with the update as its initial state (the
/// inversion is logged); a late `entity.upsert_requested` for an id that
/// already exists is a no-op.
pub struct EntityRequestHandler {
    host: Arc<Host>,
}

impl EntityRequestHandler {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }

    fn header_from_payload(&self, id: &str, kind: Kind, payload: &serde_json::Value) -> Header {
        let title = payload
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("untitled");
        let mut header = Header::draft(kind, title);
        header.id = id.to_string();
        if let Some(tags) = payload.get("tags").and_then(|t| t.as_array()) {
            header.tags = tags
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect();
        }
        if let Some(state) = payload
            .get("state")
            .and_then(|s| s.as_str())
            .and_then(EntityState::from_slug)
        {
            header.state = state;
        }
        header
    }
}

#[async_trait]
impl EventHandler for EntityRequestHandler {
    fn name(&self) -> &str {
        "entity-request"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let payload = &envelope.payload;
        let Some(id) = payload.get("id").and_then(|i| i.as_str()) else {
            tracing::warn!(event_id = %envelope.event_id, "entity request without id dropped");
            return Ok(());
        };
        let kind = Kind::from_id(id).ok_or_else(|| KiraError::NotFound { id: id.to_string() })?;
        let body = payload.get("body").and_then(|b| b.as_str()).unwrap_or("");
        let exists = self.host.read(id).is_ok();
        let opts = WriteOptions {
            trace_id: Some(envelope.trace_id.clone()),
            sync_origin: false,
            now: Some(envelope.event_ts),
        };

        match envelope.event_type.as_str() {
            types::ENTITY_UPSERT_REQUESTED => {
                if exists {
                    // The matching update already materialized this id.
                    tracing::debug!(id, "create request for existing entity is a no-op");
                    return Ok(());
                }
                let header = self.header_from_payload(id, kind, payload);
                self.host.create(kind, header, body, &opts)?;
            }
            types::ENTITY_UPDATE_REQUESTED => {
                if !exists {
                    tracing::info!(id, "edit-before-create inversion: materializing from update");
                    let header = self.header_from_payload(id, kind, payload);
                    self.host.create(kind, header, body, &opts)?;
                    return Ok(());
                }
                let patch = HeaderPatch {
                    title: payload
                        .get("title")
                        .and_then(|t| t.as_str())
                        .map(str::to_string),
                    tags: payload.get("tags").and_then(|t| t.as_array()).map(|tags| {
                        tags.iter()
                            .filter_map(|t| t.as_str().map(str::to_string))
                            .collect()
                    }),
                    state: payload
                        .get("state")
                        .and_then(|s| s.as_str())
                        .and_then(EntityState::from_slug),
                    ..HeaderPatch::default()
                };
                let body = payload.get("body").and_then(|b| b.as_str());
                self.host.update(id, &patch, body, &opts)?;
            }
            other => {
                tracing::warn!(event_type = other, "entity request handler got unexpected type");
            }
        }
        Ok(())
    }
}

/// Reacts to local post-write events by pushing mirrored entities
/// outward.  Sync-origin events are the reconciler's own imports and
/// must not bounce back.
pub struct SyncPushHandler {
    reconciler: Arc<Reconciler>,
}

impl SyncPushHandler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl EventHandler for SyncPushHandler {
    fn name(&self) -> &str {
        "sync-push"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        if !self.reconciler.wants_push(envelope) {
            return Ok(());
        }
        self.reconciler.push().await.map(|_| ())
    }
}

/// Scheduler-driven full sync cycle (pull, then push).
pub struct SyncCycleHandler {
    reconciler: Arc<Reconciler>,
}

impl SyncCycleHandler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl EventHandler for SyncCycleHandler {
    fn name(&self) -> &str {
        "sync-cycle"
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        let summary = self.reconciler.run_cycle().await?;
        tracing::info!(
            imported = summary.pull.imported,
            echoes = summary.pull.echoes,
            pushed = summary.push.pushed,
            "sync cycle complete"
        );
        Ok(())
    }
}

/// Renders the requested rollup and persists it under
/// `artifacts/rollups/`.
pub struct RollupHandler {
    engine: Arc<RollupEngine>,
    vault_root: PathBuf,
    zone: Tz,
}

impl RollupHandler {
    pub fn new(engine: Arc<RollupEngine>, vault_root: PathBuf, zone: Tz) -> Self {
        Self {
            engine,
            vault_root,
            zone,
        }
    }
}

#[async_trait]
impl EventHandler for RollupHandler {
    fn name(&self) -> &str {
        "rollup"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let scope = envelope
            .payload
            .get("scope")
            .and_then(|s| s.as_str())
            .unwrap_or("daily");
        let date = envelope
            .payload
            .get("date")
            .and_then(|d| d.as_str())
            .and_then(|d| d.parse().ok())
            .unwrap_or_else(|| now_utc().with_timezone(&self.zone).date_naive());

        let doc = match scope {
            "weekly" => self.engine.weekly(date, self.zone)?,
            _ => self.engine.daily(date, self.zone)?,
        };
        let rendered = render_markdown(&doc);
        let path = self
            .vault_root
            .join("artifacts")
            .join("rollups")
            .join(format!("{scope}-{date}.md"));
        atomic_write(&path, rendered.as_bytes())?;
        tracing::info!(scope, %date, path = %path.display(), "rollup written");
        Ok(())
    }
}

/// TTL purge and compaction of the idempotency store, plus link-journal
/// compaction.
pub struct MaintenanceHandler {
    store: Arc<Mutex<IdempotencyStore>>,
    host: Arc<Host>,
    ttl_days: i64,
}

impl MaintenanceHandler {
    pub fn new(store: Arc<Mutex<IdempotencyStore>>, host: Arc<Host>, ttl_days: i64) -> Self {
        Self {
            store,
            host,
            ttl_days,
        }
    }
}

#[async_trait]
impl EventHandler for MaintenanceHandler {
    fn name(&self) -> &str {
        "maintenance"
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        let cutoff = now_utc() - chrono::Duration::days(self.ttl_days);
        {
            let mut store = self
                .store
                .lock()
                .map_err(|_| KiraError::Storage("idempotency store lock poisoned".to_string()))?;
            let removed = store.purge_older_than(cutoff)?;
            if removed > 0 {
                store.compact()?;
            }
        }
        self.host.compact_graph()?;
        Ok(())
    }
}
