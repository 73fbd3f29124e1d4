//! Historical id aliases, persisted as `.aliases.json`.
//!
//! Renames go through delete-then-create; the old id is recorded here
//! so body references written against it keep resolving.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use kira_core::error::Result;

use crate::writer::atomic_write;

#[derive(Debug)]
pub struct AliasTable {
    path: PathBuf,
    /// alias id → canonical id.
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn load(vault_root: &Path) -> Result<Self> {
        let path = vault_root.join(".aliases.json");
        let aliases = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "alias table unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, aliases })
    }

    /// Record that `old_id` now refers to `new_id`.  Chains collapse so a
    /// second rename repoints earlier aliases at the final id.
    pub fn record_rename(&mut self, old_id: &str, new_id: &str) -> Result<()> {
        for target in self.aliases.values_mut() {
            if target == old_id {
                *target = new_id.to_string();
            }
        }
        self.aliases.insert(old_id.to_string(), new_id.to_string());
        self.persist()
    }

    pub fn resolve(&self, id: &str) -> Option<&str> {
        self.aliases.get(id).map(String::as_str)
    }

    pub fn known_aliases(&self) -> impl Iterator<Item = &str> {
        self.aliases.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let rendered = serde_json::to_string_pretty(&self.aliases)
            .map_err(|err| kira_core::KiraError::Storage(err.to_string()))?;
        atomic_write(&self.path, rendered.as_bytes())?;
        Ok(())
    }
}
