//! Domain entities: the three vault kinds and their shared header.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three entity kinds stored in the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Task,
    Note,
    Event,
}

impl Kind {
    pub fn slug(self) -> &'static str {
        match self {
            Kind::Task => "task",
            Kind::Note => "note",
            Kind::Event => "event",
        }
    }

    /// Vault subdirectory holding this kind (`tasks/`, `notes/`, `events/`).
    pub fn dir_name(self) -> &'static str {
        match self {
            Kind::Task => "tasks",
            Kind::Note => "notes",
            Kind::Event => "events",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "task" => Some(Kind::Task),
            "note" => Some(Kind::Note),
            "event" => Some(Kind::Event),
            _ => None,
        }
    }

    /// Recover the kind from an entity id (`task-20251008-1342-…`).
    pub fn from_id(id: &str) -> Option<Self> {
        id.split('-').next().and_then(Self::from_slug)
    }

    pub fn all() -> [Kind; 3] {
        [Kind::Task, Kind::Note, Kind::Event]
    }

    /// Default lifecycle state for a freshly created entity.
    pub fn initial_state(self) -> EntityState {
        match self {
            Kind::Task => EntityState::Todo,
            Kind::Note | Kind::Event => EntityState::Active,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Union of the per-kind state machines.
///
/// Tasks use `todo/doing/review/done/blocked`; notes and events use the
/// minimal `active/archived` lifecycle.  Which values are legal for
/// which kind is enforced by the validator, not the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Todo,
    Doing,
    Review,
    Done,
    Blocked,
    Active,
    Archived,
}

impl EntityState {
    pub fn slug(self) -> &'static str {
        match self {
            EntityState::Todo => "todo",
            EntityState::Doing => "doing",
            EntityState::Review => "review",
            EntityState::Done => "done",
            EntityState::Blocked => "blocked",
            EntityState::Active => "active",
            EntityState::Archived => "archived",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "todo" => Some(EntityState::Todo),
            "doing" => Some(EntityState::Doing),
            "review" => Some(EntityState::Review),
            "done" => Some(EntityState::Done),
            "blocked" => Some(EntityState::Blocked),
            "active" => Some(EntityState::Active),
            "archived" => Some(EntityState::Archived),
            _ => None,
        }
    }

    pub fn valid_for(self, kind: Kind) -> bool {
        match kind {
            Kind::Task => matches!(
                self,
                EntityState::Todo
                    | EntityState::Doing
                    | EntityState::Review
                    | EntityState::Done
                    | EntityState::Blocked
            ),
            Kind::Note | Kind::Event => {
                matches!(self, EntityState::Active | EntityState::Archived)
            }
        }
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// `x-sync` sub-map carried by entities mirrored from a remote system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub source: String,
    pub remote_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_ts: Option<DateTime<Utc>>,
}

/// The structured YAML header shared by every entity file.
///
/// Unknown keys survive in `extra` so third-party frontmatter round-trips
/// through the codec untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub id: String,
    pub title: String,
    pub state: EntityState,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relates_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_frozen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reopen_reason: Option<String>,
    #[serde(default, rename = "x-sync", skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
    /// Keys the schema does not know about, preserved verbatim.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            state: EntityState::Active,
            tags: Vec::new(),
            created_ts: DateTime::<Utc>::UNIX_EPOCH,
            updated_ts: DateTime::<Utc>::UNIX_EPOCH,
            due_ts: None,
            start_ts: None,
            end_ts: None,
            done_ts: None,
            links: Vec::new(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            relates_to: Vec::new(),
            assignee: None,
            attendees: Vec::new(),
            blocked_reason: None,
            estimate: None,
            estimate_frozen: None,
            location: None,
            reopen_reason: None,
            sync: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Header {
    /// A header draft for [`Kind`] with the kind's initial state and no id;
    /// the Host assigns `id`/`created_ts`/`updated_ts` on create.
    pub fn draft(kind: Kind, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            state: kind.initial_state(),
            ..Self::default()
        }
    }

    /// All referenced entity ids declared in header relationship fields.
    pub fn relation_ids(&self) -> impl Iterator<Item = &str> {
        self.links
            .iter()
            .chain(&self.depends_on)
            .chain(&self.blocks)
            .chain(&self.relates_to)
            .map(String::as_str)
    }
}

/// A parsed vault entity: header plus free-form Markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: Kind,
    pub header: Header,
    pub body: String,
}

impl Entity {
    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// Canonical file location: `{vault_root}/{kind}s/{id}.md`.
    pub fn path_in(&self, vault_root: &Path) -> PathBuf {
        entity_path(vault_root, self.kind, &self.header.id)
    }
}

pub fn entity_path(vault_root: &Path, kind: Kind, id: &str) -> PathBuf {
    vault_root.join(kind.dir_name()).join(format!("{id}.md"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_recovered_from_id() {
        assert_eq!(Kind::from_id("task-20251008-1342-review"), Some(Kind::Task));
        assert_eq!(Kind::from_id("note-20250101-0000-x"), Some(Kind::Note));
        assert_eq!(Kind::from_id("bogus-123"), None);
    }

    #[test]
    fn task_states_invalid_for_notes() {
        assert!(EntityState::Doing.valid_for(Kind::Task));
        assert!(!EntityState::Doing.valid_for(Kind::Note));
        assert!(EntityState::Archived.valid_for(Kind::Event));
        assert!(!EntityState::Archived.valid_for(Kind::Task));
    }

    #[test]
    fn draft_uses_kind_initial_state() {
        assert_eq!(Header::draft(Kind::Task, "t").state, EntityState::Todo);
        assert_eq!(Header::draft(Kind::Note, "n").state, EntityState::Active);
    }

    #[test]
    fn entity_path_layout() {
        let p = entity_path(Path::new("/vault"), Kind::Task, "task-20251008-1342-x");
        assert_eq!(p, PathBuf::from("/vault/tasks/task-20251008-1342-x.md"));
    }
}
