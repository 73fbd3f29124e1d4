//! The Host: the one component allowed to mutate entity files.
//!
//! Every write follows the same path: acquire the per-id lock, read
//! current state when updating, merge, validate (schema + FSM), then
//! either quarantine-and-raise with zero disk changes, or serialize,
//! write atomically, update the link graph journal-first, and emit a
//! post-write envelope.  Reads are lock-free.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;

use kira_config::HostConfig;
use kira_core::envelope::{Envelope, types};
use kira_core::error::{KiraError, Result};
use kira_core::{
    Entity, EntityState, Header, Kind, SyncMeta, entity_path, generate_entity_id, new_trace_id,
    now_utc,
};

use crate::alias::AliasTable;
use crate::audit::AuditTrail;
use crate::fsm::apply_transition;
use crate::frontmatter::{parse_document, render_document};
use crate::graph::{GraphDiagnosis, LinkGraph, extract_edges};
use crate::lock::LockManager;
use crate::quarantine::{Quarantine, QuarantineRecord};
use crate::validate::validate;
use crate::writer::{atomic_write, durable_remove};

/// Sink for post-write events.  The runtime wires this to the bus; tools
/// that only need storage use [`NullEmitter`].
pub trait PostWriteEmitter: Send + Sync {
    fn emit(&self, envelope: Envelope);
}

#[derive(Debug, Default)]
pub struct NullEmitter;

impl PostWriteEmitter for NullEmitter {
    fn emit(&self, _envelope: Envelope) {}
}

/// Per-call context for a Host write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Correlation id threaded into audit, quarantine, and post-write
    /// events.  Generated when absent.
    pub trace_id: Option<String>,
    /// Marks post-write events as caused by a sync import so the
    /// reconciler does not push them back out.
    pub sync_origin: bool,
    /// Clock override; handlers stamp entities with the event time.
    pub now: Option<DateTime<Utc>>,
}

impl WriteOptions {
    pub fn with_trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Self::default()
        }
    }
}

/// Partial header for `update`.  `None` leaves a field alone; the inner
/// `Option` distinguishes set from clear.  Guarded fields (`done_ts`,
/// `blocked_reason`, `reopen_reason`, `estimate_frozen`) are absent on
/// purpose: only the FSM mutates them.
#[derive(Debug, Clone, Default)]
pub struct HeaderPatch {
    pub title: Option<String>,
    pub state: Option<EntityState>,
    pub tags: Option<Vec<String>>,
    pub due_ts: Option<Option<DateTime<Utc>>>,
    pub start_ts: Option<Option<DateTime<Utc>>>,
    pub end_ts: Option<Option<DateTime<Utc>>>,
    pub links: Option<Vec<String>>,
    pub depends_on: Option<Vec<String>>,
    pub blocks: Option<Vec<String>>,
    pub relates_to: Option<Vec<String>>,
    pub assignee: Option<Option<String>>,
    pub attendees: Option<Vec<String>>,
    pub estimate: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub sync: Option<Option<SyncMeta>>,
    pub extra: Option<BTreeMap<String, serde_json::Value>>,
}

impl HeaderPatch {
    fn apply(&self, header: &mut Header) {
        if let Some(title) = &self.title {
            header.title = title.clone();
        }
        if let Some(tags) = &self.tags {
            header.tags = tags.clone();
        }
        if let Some(due_ts) = self.due_ts {
            header.due_ts = due_ts;
        }
        if let Some(start_ts) = self.start_ts {
            header.start_ts = start_ts;
        }
        if let Some(end_ts) = self.end_ts {
            header.end_ts = end_ts;
        }
        if let Some(links) = &self.links {
            header.links = links.clone();
        }
        if let Some(depends_on) = &self.depends_on {
            header.depends_on = depends_on.clone();
        }
        if let Some(blocks) = &self.blocks {
            header.blocks = blocks.clone();
        }
        if let Some(relates_to) = &self.relates_to {
            header.relates_to = relates_to.clone();
        }
        if let Some(assignee) = &self.assignee {
            header.assignee = assignee.clone();
        }
        if let Some(attendees) = &self.attendees {
            header.attendees = attendees.clone();
        }
        if let Some(estimate) = &self.estimate {
            header.estimate = estimate.clone();
        }
        if let Some(location) = &self.location {
            header.location = location.clone();
        }
        if let Some(sync) = &self.sync {
            header.sync = sync.clone();
        }
        if let Some(extra) = &self.extra {
            header.extra = extra.clone();
        }
    }
}

pub struct Host {
    vault_root: PathBuf,
    locks: LockManager,
    // Lock order when both are needed: aliases before graph.
    aliases: Mutex<AliasTable>,
    graph: Mutex<LinkGraph>,
    audit: AuditTrail,
    quarantine: Quarantine,
    emitter: Box<dyn PostWriteEmitter>,
}

impl Host {
    /// Open (or scaffold) a vault and replay the link journal.
    pub fn open(
        vault_root: impl Into<PathBuf>,
        config: &HostConfig,
        emitter: Box<dyn PostWriteEmitter>,
    ) -> Result<Self> {
        let vault_root = vault_root.into();
        for dir in [
            "tasks",
            "notes",
            "events",
            "inbox",
            ".locks",
            ".state",
            "artifacts/quarantine",
            "artifacts/audit",
            "artifacts/rollups",
        ] {
            fs::create_dir_all(vault_root.join(dir))?;
        }

        let locks = LockManager::new(&vault_root, Duration::from_secs(config.lock_timeout_secs));
        let aliases = AliasTable::load(&vault_root)?;
        let graph = LinkGraph::open(&vault_root, config.near_duplicate_threshold)?;
        let audit = AuditTrail::new(&vault_root);
        let quarantine = Quarantine::new(&vault_root);

        Ok(Self {
            vault_root,
            locks,
            aliases: Mutex::new(aliases),
            graph: Mutex::new(graph),
            audit,
            quarantine,
            emitter,
        })
    }

    pub fn vault_root(&self) -> &Path {
        &self.vault_root
    }

    // ── write surface ────────────────────────────────────────────────────────

    /// Create a new entity.  The id is generated unless the caller
    /// supplied one (sync imports, edit-before-create inversion).
    pub fn create(
        &self,
        kind: Kind,
        mut header: Header,
        body: &str,
        opts: &WriteOptions,
    ) -> Result<Entity> {
        let started = Instant::now();
        let trace = trace_of(opts);
        let now = opts.now.unwrap_or_else(now_utc);

        if header.created_ts == DateTime::<Utc>::UNIX_EPOCH {
            header.created_ts = now;
        }
        if header.updated_ts < header.created_ts {
            header.updated_ts = header.created_ts;
        }
        if header.id.is_empty() {
            header.id = generate_entity_id(kind, &header.title, header.created_ts, &self.existing_ids()?);
        }
        let id = header.id.clone();

        let result = (|| {
            let _lock = self.locks.acquire(&id)?;
            let path = entity_path(&self.vault_root, kind, &id);
            if path.exists() {
                let issues = vec![kira_core::ValidationIssue::new(
                    kira_core::IssueCategory::Schema,
                    "id",
                    format!("id '{id}' already exists"),
                    "use upsert or update to modify an existing entity",
                )];
                self.quarantine_validation(kind, &trace, &issues, &header, body);
                return Err(KiraError::Validation { issues });
            }
            self.check(kind, &header, body, &trace)?;
            self.persist(kind, &header, body)?;
            self.emit(
                types::ENTITY_CREATED,
                json!({
                    "id": id,
                    "kind": kind.slug(),
                    "title": header.title,
                    "state": header.state.slug(),
                }),
                &trace,
                opts.sync_origin,
            );
            Ok(Entity {
                kind,
                header: header.clone(),
                body: body.to_string(),
            })
        })();

        self.finish("host.create", Some(&id), &trace, started, &result);
        result
    }

    /// Merge a partial header (and optionally a new body) into an
    /// existing entity.  State changes route through the FSM guards.
    pub fn update(
        &self,
        id: &str,
        patch: &HeaderPatch,
        body: Option<&str>,
        opts: &WriteOptions,
    ) -> Result<Entity> {
        let started = Instant::now();
        let trace = trace_of(opts);

        let result = (|| {
            let kind = kind_of(id)?;
            let _lock = self.locks.acquire(id)?;
            let current = self.read_at(kind, id)?;
            let now = opts.now.unwrap_or_else(now_utc);

            let mut header = current.header.clone();
            let mut transitioned = None;
            if let Some(to) = patch.state {
                if to != header.state {
                    let from = header.state;
                    header = self.guard_transition(kind, &header, to, None, now, &trace, body)?;
                    transitioned = Some((from, to));
                }
            }
            patch.apply(&mut header);
            header.updated_ts = now.max(header.created_ts);

            let body = body.unwrap_or(&current.body);
            self.check(kind, &header, body, &trace)?;
            self.persist(kind, &header, body)?;

            self.emit(
                types::ENTITY_UPDATED,
                json!({
                    "id": id,
                    "kind": kind.slug(),
                    "title": header.title,
                    "state": header.state.slug(),
                }),
                &trace,
                opts.sync_origin,
            );
            if let Some((from, to)) = transitioned {
                if kind == Kind::Task {
                    self.emit(
                        types::TASK_TRANSITIONED,
                        json!({"id": id, "from": from.slug(), "to": to.slug()}),
                        &trace,
                        opts.sync_origin,
                    );
                }
            }
            Ok(Entity {
                kind,
                header,
                body: body.to_string(),
            })
        })();

        self.finish("host.update", Some(id), &trace, started, &result);
        result
    }

    /// Apply one state-machine transition.  Guard failures leave the
    /// file bytes untouched and produce a quarantine record.
    pub fn transition(
        &self,
        id: &str,
        to: EntityState,
        reason: Option<&str>,
        opts: &WriteOptions,
    ) -> Result<Entity> {
        let started = Instant::now();
        let trace = trace_of(opts);

        let result = (|| {
            let kind = kind_of(id)?;
            let _lock = self.locks.acquire(id)?;
            let current = self.read_at(kind, id)?;
            let now = opts.now.unwrap_or_else(now_utc);
            let from = current.header.state;

            let mut header =
                self.guard_transition(kind, &current.header, to, reason, now, &trace, None)?;
            header.updated_ts = now.max(header.created_ts);

            self.check(kind, &header, &current.body, &trace)?;
            self.persist(kind, &header, &current.body)?;

            let event_type = if kind == Kind::Task {
                types::TASK_TRANSITIONED
            } else {
                types::ENTITY_UPDATED
            };
            self.emit(
                event_type,
                json!({"id": id, "from": from.slug(), "to": to.slug()}),
                &trace,
                opts.sync_origin,
            );
            Ok(Entity {
                kind,
                header,
                body: current.body,
            })
        })();

        self.finish("host.transition", Some(id), &trace, started, &result);
        result
    }

    /// Create-or-update keyed by `header.id`; re-execution converges,
    /// which is what makes at-least-once delivery safe for handlers.
    pub fn upsert(
        &self,
        kind: Kind,
        header: Header,
        body: &str,
        opts: &WriteOptions,
    ) -> Result<Entity> {
        if header.id.is_empty() {
            return self.create(kind, header, body, opts);
        }
        let path = entity_path(&self.vault_root, kind, &header.id);
        if !path.exists() {
            return self.create(kind, header, body, opts);
        }

        let started = Instant::now();
        let trace = trace_of(opts);
        let id = header.id.clone();

        let result = (|| {
            let _lock = self.locks.acquire(&id)?;
            let current = self.read_at(kind, &id)?;
            let now = opts.now.unwrap_or_else(now_utc);

            let mut header = header;
            // created_ts is immutable after first write.
            header.created_ts = current.header.created_ts;
            header.updated_ts = now.max(header.created_ts);

            self.check(kind, &header, body, &trace)?;
            self.persist(kind, &header, body)?;
            self.emit(
                types::ENTITY_UPDATED,
                json!({
                    "id": id,
                    "kind": kind.slug(),
                    "title": header.title,
                    "state": header.state.slug(),
                }),
                &trace,
                opts.sync_origin,
            );
            Ok(Entity {
                kind,
                header,
                body: body.to_string(),
            })
        })();

        self.finish("host.upsert", Some(&id), &trace, started, &result);
        result
    }

    /// Remove an entity.  Inbound links elsewhere become broken; the
    /// alias table keeps historical names resolving.
    pub fn delete(&self, id: &str, opts: &WriteOptions) -> Result<()> {
        let started = Instant::now();
        let trace = trace_of(opts);

        let result = (|| {
            let kind = kind_of(id)?;
            let _lock = self.locks.acquire(id)?;
            let path = entity_path(&self.vault_root, kind, id);
            if !path.exists() {
                return Err(KiraError::NotFound { id: id.to_string() });
            }
            durable_remove(&path)?;
            {
                let mut graph = self.lock_graph()?;
                graph.on_entity_delete(id)?;
            }
            self.emit(
                types::ENTITY_DELETED,
                json!({"id": id, "kind": kind.slug()}),
                &trace,
                opts.sync_origin,
            );
            Ok(())
        })();

        self.finish("host.delete", Some(id), &trace, started, &result);
        result
    }

    // ── read surface ─────────────────────────────────────────────────────────

    pub fn read(&self, id: &str) -> Result<Entity> {
        let kind = kind_of(id)?;
        self.read_at(kind, id)
    }

    pub fn list(&self, kind: Option<Kind>) -> Result<Vec<Entity>> {
        self.list_filtered(kind, |_| true)
    }

    pub fn list_filtered(
        &self,
        kind: Option<Kind>,
        predicate: impl Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>> {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => Kind::all().to_vec(),
        };
        let mut entities = Vec::new();
        for kind in kinds {
            let dir = self.vault_root.join(kind.dir_name());
            let Ok(read_dir) = fs::read_dir(&dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = read_dir
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
                .collect();
            paths.sort();
            for path in paths {
                match self.parse_file(kind, &path) {
                    Ok(entity) => {
                        if predicate(&entity) {
                            entities.push(entity);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable entity file");
                    }
                }
            }
        }
        Ok(entities)
    }

    /// Every id currently claimed: entity files plus historical aliases.
    pub fn existing_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for kind in Kind::all() {
            let dir = self.vault_root.join(kind.dir_name());
            let Ok(read_dir) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "md") {
                    if let Some(stem) = path.file_stem() {
                        ids.insert(stem.to_string_lossy().to_string());
                    }
                }
            }
        }
        let aliases = self.lock_aliases()?;
        for alias in aliases.known_aliases() {
            ids.insert(alias.to_string());
        }
        Ok(ids)
    }

    // ── graph surface ────────────────────────────────────────────────────────

    pub fn backlinks(&self, id: &str) -> Result<Vec<String>> {
        let aliases = self.lock_aliases()?;
        let mut graph = self.lock_graph()?;
        Ok(graph.query_backlinks(id, &aliases))
    }

    pub fn diagnose(&self) -> Result<GraphDiagnosis> {
        let aliases = self.lock_aliases()?;
        let mut graph = self.lock_graph()?;
        Ok(graph.diagnose(&aliases))
    }

    /// Record that `old_id` was renamed to `new_id` (rename itself is
    /// delete-then-create, driven by the caller).
    pub fn record_rename(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut aliases = self.lock_aliases()?;
        aliases.record_rename(old_id, new_id)
    }

    /// Rebuild the link graph from a full vault scan; returns the number
    /// of entities ingested.  Used by startup recovery and `doctor`.
    pub fn rebuild_graph(&self) -> Result<usize> {
        let entities = self.list(None)?;
        let scanned: Vec<(String, String, Vec<crate::graph::RawEdge>)> = entities
            .iter()
            .map(|e| {
                (
                    e.header.id.clone(),
                    e.header.title.clone(),
                    extract_edges(&e.header, &e.body),
                )
            })
            .collect();
        let mut graph = self.lock_graph()?;
        graph.rebuild_from_scan(scanned.iter().map(|(id, title, edges)| {
            (id.as_str(), title.as_str(), edges.clone())
        }))?;
        Ok(entities.len())
    }

    /// Compact the link journal to current state.
    pub fn compact_graph(&self) -> Result<()> {
        let mut graph = self.lock_graph()?;
        graph.compact()
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn read_at(&self, kind: Kind, id: &str) -> Result<Entity> {
        let path = entity_path(&self.vault_root, kind, id);
        self.parse_file(kind, &path)
            .map_err(|err| match err {
                KiraError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    KiraError::NotFound { id: id.to_string() }
                }
                other => other,
            })
    }

    fn parse_file(&self, kind: Kind, path: &Path) -> Result<Entity> {
        let raw = fs::read_to_string(path)?;
        let (header, body) = parse_document(&raw)?;
        Ok(Entity { kind, header, body })
    }

    /// Validate or quarantine-and-raise.  No disk mutation on failure.
    fn check(&self, kind: Kind, header: &Header, body: &str, trace: &str) -> Result<()> {
        let issues = validate(kind, header);
        if issues.is_empty() {
            return Ok(());
        }
        self.quarantine_validation(kind, trace, &issues, header, body);
        Err(KiraError::Validation { issues })
    }

    fn guard_transition(
        &self,
        kind: Kind,
        header: &Header,
        to: EntityState,
        reason: Option<&str>,
        now: DateTime<Utc>,
        trace: &str,
        body: Option<&str>,
    ) -> Result<Header> {
        match apply_transition(kind, header, to, reason, now) {
            Ok(next) => Ok(next),
            Err(err) => {
                let issue = kira_core::ValidationIssue::new(
                    kira_core::IssueCategory::Fsm,
                    "state",
                    err.to_string(),
                    "consult the task transition table for the allowed moves",
                );
                let record = QuarantineRecord::new(
                    kind,
                    trace,
                    "fsm_guard_failed",
                    vec![issue],
                    json!({
                        "header": header,
                        "body": body,
                        "requested_state": to.slug(),
                        "reason": reason,
                    }),
                );
                if let Err(qerr) = self.quarantine.persist(&record) {
                    tracing::warn!(error = %qerr, "failed to persist quarantine record");
                }
                Err(err)
            }
        }
    }

    fn quarantine_validation(
        &self,
        kind: Kind,
        trace: &str,
        issues: &[kira_core::ValidationIssue],
        header: &Header,
        body: &str,
    ) {
        let record = QuarantineRecord::new(
            kind,
            trace,
            "validation_failed",
            issues.to_vec(),
            json!({"header": header, "body": body}),
        );
        if let Err(err) = self.quarantine.persist(&record) {
            tracing::warn!(error = %err, "failed to persist quarantine record");
        }
    }

    fn persist(&self, kind: Kind, header: &Header, body: &str) -> Result<()> {
        let rendered = render_document(header, body);
        let path = entity_path(&self.vault_root, kind, &header.id);
        atomic_write(&path, rendered.as_bytes())?;
        let mut graph = self.lock_graph()?;
        graph.on_entity_upsert(&header.id, &header.title, extract_edges(header, body))?;
        Ok(())
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value, trace: &str, sync_origin: bool) {
        let envelope = Envelope::new("host", event_type, payload)
            .with_trace(trace)
            .with_sync_origin(sync_origin);
        self.emitter.emit(envelope);
    }

    fn finish<T>(
        &self,
        operation: &str,
        subject: Option<&str>,
        trace: &str,
        started: Instant,
        result: &Result<T>,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => self.audit.success(operation, subject, trace, duration_ms),
            Err(err) => self.audit.failure(
                operation,
                subject,
                trace,
                duration_ms,
                err.code(),
                json!({"message": err.to_string()}),
            ),
        }
    }

    fn lock_graph(&self) -> Result<std::sync::MutexGuard<'_, LinkGraph>> {
        self.graph
            .lock()
            .map_err(|_| KiraError::Storage("link graph lock poisoned".to_string()))
    }

    fn lock_aliases(&self) -> Result<std::sync::MutexGuard<'_, AliasTable>> {
        self.aliases
            .lock()
            .map_err(|_| KiraError::Storage("alias table lock poisoned".to_string()))
    }
}

fn kind_of(id: &str) -> Result<Kind> {
    Kind::from_id(id).ok_or_else(|| KiraError::NotFound { id: id.to_string() })
}

fn trace_of(opts: &WriteOptions) -> String {
    opts.trace_id.clone().unwrap_or_else(new_trace_id)
}
