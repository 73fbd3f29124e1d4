//! Bidirectional link graph over the vault.
//!
//! Forward edges come from header relationship fields and `[[target]]`
//! references in bodies.  Nodes live in an integer arena; targets are
//! kept as raw text and resolved lazily against ids, the alias table,
//! and a title index, so a target that appears before its entity is
//! merely "broken" until the entity shows up.
//!
//! Mutations are journaled first (append-only JSONL, fsync per record)
//! and applied to the in-memory index second; startup replays the
//! journal, and a full rebuild from a vault scan is always possible.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use kira_core::error::Result;
use kira_core::{Header, KiraError};

use crate::alias::AliasTable;
use crate::writer::{append_line, atomic_write};

static BODY_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[([^\[\]]+)\]\]").unwrap_or_else(|_| unreachable!("static pattern"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Link,
    DependsOn,
    Blocks,
    RelatesTo,
    Body,
}

/// An extracted reference before resolution.  `target` may be an id, an
/// alias, or a title.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawEdge {
    pub target: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Upsert {
        id: String,
        title: String,
        edges: Vec<RawEdge>,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub left: String,
    pub right: String,
    pub similarity: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GraphDiagnosis {
    pub orphans: Vec<String>,
    pub cycles: Vec<Vec<String>>,
    pub broken: Vec<BrokenLink>,
    pub near_duplicates: Vec<NearDuplicate>,
}

/// Resolved view, rebuilt lazily after mutations.
#[derive(Debug, Default)]
struct Resolution {
    /// Per source arena index: resolved (target, kind) pairs.
    resolved: Vec<Vec<(usize, EdgeKind)>>,
    /// target arena index → source arena indexes.
    inverse: HashMap<usize, Vec<usize>>,
    /// Unresolvable raw targets per source.
    broken: Vec<(usize, String)>,
}

#[derive(Debug)]
pub struct LinkGraph {
    journal_path: PathBuf,
    ids: Vec<String>,
    index_of: HashMap<String, usize>,
    titles: Vec<String>,
    alive: Vec<bool>,
    forward: Vec<Vec<RawEdge>>,
    resolution: Option<Resolution>,
    near_duplicate_threshold: f64,
}

impl LinkGraph {
    /// Open the graph, replaying any existing journal.
    pub fn open(vault_root: &Path, near_duplicate_threshold: f64) -> Result<Self> {
        let journal_path = vault_root.join(".state").join("link_journal.log");
        let mut graph = Self {
            journal_path,
            ids: Vec::new(),
            index_of: HashMap::new(),
            titles: Vec::new(),
            alive: Vec::new(),
            forward: Vec::new(),
            resolution: None,
            near_duplicate_threshold,
        };
        graph.replay()?;
        Ok(graph)
    }

    fn replay(&mut self) -> Result<()> {
        if !self.journal_path.exists() {
            return Ok(());
        }
        let file = fs::File::open(&self.journal_path)?;
        let reader = BufReader::new(file);
        let mut corrupt = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(record) => self.apply(record),
                Err(_) => corrupt += 1,
            }
        }
        if corrupt > 0 {
            tracing::warn!(
                corrupt_lines = corrupt,
                path = %self.journal_path.display(),
                "link journal replayed with skipped corrupt lines"
            );
        }
        Ok(())
    }

    /// Journal-first upsert: the record is durable before the in-memory
    /// index changes, so a crash in between is repaired by replay.
    pub fn on_entity_upsert(&mut self, id: &str, title: &str, edges: Vec<RawEdge>) -> Result<()> {
        let record = JournalRecord::Upsert {
            id: id.to_string(),
            title: title.to_string(),
            edges,
        };
        self.journal(&record)?;
        self.apply(record);
        Ok(())
    }

    pub fn on_entity_delete(&mut self, id: &str) -> Result<()> {
        let record = JournalRecord::Delete { id: id.to_string() };
        self.journal(&record)?;
        self.apply(record);
        Ok(())
    }

    fn journal(&self, record: &JournalRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|err| KiraError::Storage(err.to_string()))?;
        append_line(&self.journal_path, &line)?;
        Ok(())
    }

    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Upsert { id, title, edges } => {
                let idx = self.intern(&id);
                self.titles[idx] = title;
                self.alive[idx] = true;
                self.forward[idx] = edges;
            }
            JournalRecord::Delete { id } => {
                if let Some(&idx) = self.index_of.get(&id) {
                    self.alive[idx] = false;
                    self.forward[idx].clear();
                }
            }
        }
        self.resolution = None;
    }

    fn intern(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index_of.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id.to_string());
        self.index_of.insert(id.to_string(), idx);
        self.titles.push(String::new());
        self.alive.push(false);
        self.forward.push(Vec::new());
        idx
    }

    /// Entities whose edges resolve to `id`, sorted.
    pub fn query_backlinks(&mut self, id: &str, aliases: &AliasTable) -> Vec<String> {
        let Some(&idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        self.ensure_resolution(aliases);
        let Some(resolution) = &self.resolution else {
            return Vec::new();
        };
        let mut sources: Vec<String> = resolution
            .inverse
            .get(&idx)
            .map(|s| s.iter().map(|&i| self.ids[i].clone()).collect())
            .unwrap_or_default();
        sources.sort();
        sources.dedup();
        sources
    }

    pub fn broken_count(&mut self, aliases: &AliasTable) -> usize {
        self.ensure_resolution(aliases);
        self.resolution.as_ref().map(|r| r.broken.len()).unwrap_or(0)
    }

    /// Full health report: orphans, cycles, broken links, near-duplicate
    /// titles.  Advisory; nothing here gates a write.
    pub fn diagnose(&mut self, aliases: &AliasTable) -> GraphDiagnosis {
        self.ensure_resolution(aliases);
        let Some(resolution) = &self.resolution else {
            return GraphDiagnosis::default();
        };

        let mut has_inbound: Vec<bool> = vec![false; self.ids.len()];
        for &target in resolution.inverse.keys() {
            has_inbound[target] = true;
        }

        let mut orphans = Vec::new();
        for idx in 0..self.ids.len() {
            if self.alive[idx] && self.forward[idx].is_empty() && !has_inbound[idx] {
                orphans.push(self.ids[idx].clone());
            }
        }
        orphans.sort();

        let broken = resolution
            .broken
            .iter()
            .map(|(source, target)| BrokenLink {
                source: self.ids[*source].clone(),
                target: target.clone(),
            })
            .collect();

        let cycles = self.find_cycles(resolution);
        let near_duplicates = self.find_near_duplicates();

        GraphDiagnosis {
            orphans,
            cycles,
            broken,
            near_duplicates,
        }
    }

    /// Rewrite the journal from current state (snapshot compaction).
    pub fn compact(&mut self) -> Result<()> {
        let mut rendered = String::new();
        for idx in 0..self.ids.len() {
            if !self.alive[idx] {
                continue;
            }
            let record = JournalRecord::Upsert {
                id: self.ids[idx].clone(),
                title: self.titles[idx].clone(),
                edges: self.forward[idx].clone(),
            };
            rendered.push_str(
                &serde_json::to_string(&record)
                    .map_err(|err| KiraError::Storage(err.to_string()))?,
            );
            rendered.push('\n');
        }
        atomic_write(&self.journal_path, rendered.as_bytes())?;
        Ok(())
    }

    /// Drop everything and re-ingest from a full vault scan, then
    /// compact the journal to the new state.
    pub fn rebuild_from_scan<'a>(
        &mut self,
        entities: impl Iterator<Item = (&'a str, &'a str, Vec<RawEdge>)>,
    ) -> Result<()> {
        self.ids.clear();
        self.index_of.clear();
        self.titles.clear();
        self.alive.clear();
        self.forward.clear();
        self.resolution = None;
        for (id, title, edges) in entities {
            let idx = self.intern(id);
            self.titles[idx] = title.to_string();
            self.alive[idx] = true;
            self.forward[idx] = edges;
        }
        self.compact()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of
            .get(id)
            .map(|&idx| self.alive[idx])
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── resolution ───────────────────────────────────────────────────────────

    fn ensure_resolution(&mut self, aliases: &AliasTable) {
        if self.resolution.is_some() {
            return;
        }
        let mut title_index: HashMap<String, usize> = HashMap::new();
        for idx in 0..self.ids.len() {
            if self.alive[idx] {
                title_index
                    .entry(normalize_title(&self.titles[idx]))
                    .or_insert(idx);
            }
        }

        let mut resolution = Resolution {
            resolved: vec![Vec::new(); self.ids.len()],
            ..Resolution::default()
        };
        for source in 0..self.ids.len() {
            if !self.alive[source] {
                continue;
            }
            for edge in &self.forward[source] {
                match self.resolve_target(&edge.target, aliases, &title_index) {
                    Some(target) => {
                        resolution.resolved[source].push((target, edge.kind));
                        resolution.inverse.entry(target).or_default().push(source);
                    }
                    None => resolution.broken.push((source, edge.target.clone())),
                }
            }
        }
        self.resolution = Some(resolution);
    }

    fn resolve_target(
        &self,
        target: &str,
        aliases: &AliasTable,
        title_index: &HashMap<String, usize>,
    ) -> Option<usize> {
        if let Some(&idx) = self.index_of.get(target) {
            if self.alive[idx] {
                return Some(idx);
            }
        }
        if let Some(canonical) = aliases.resolve(target) {
            if let Some(&idx) = self.index_of.get(canonical) {
                if self.alive[idx] {
                    return Some(idx);
                }
            }
        }
        title_index.get(&normalize_title(target)).copied()
    }

    fn find_cycles(&self, resolution: &Resolution) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut color = vec![Color::White; self.ids.len()];
        let mut stack: Vec<usize> = Vec::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();

        // Iterative DFS with an explicit edge cursor per frame.
        for root in 0..self.ids.len() {
            if !self.alive[root] || color[root] != Color::White {
                continue;
            }
            let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = Color::Grey;
            stack.push(root);
            while let Some((node, cursor)) = frames.last_mut() {
                let node = *node;
                if let Some(&(next, _)) = resolution.resolved[node].get(*cursor) {
                    *cursor += 1;
                    match color[next] {
                        Color::White => {
                            color[next] = Color::Grey;
                            stack.push(next);
                            frames.push((next, 0));
                        }
                        Color::Grey => {
                            let start = stack.iter().rposition(|&n| n == next).unwrap_or(0);
                            let cycle: Vec<String> =
                                stack[start..].iter().map(|&n| self.ids[n].clone()).collect();
                            cycles.push(cycle);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                    frames.pop();
                }
            }
        }
        cycles
    }

    fn find_near_duplicates(&self) -> Vec<NearDuplicate> {
        let mut pairs = Vec::new();
        let alive: Vec<usize> = (0..self.ids.len()).filter(|&i| self.alive[i]).collect();
        for (pos, &left) in alive.iter().enumerate() {
            for &right in &alive[pos + 1..] {
                let similarity = strsim::jaro_winkler(
                    &normalize_title(&self.titles[left]),
                    &normalize_title(&self.titles[right]),
                );
                if similarity >= self.near_duplicate_threshold {
                    pairs.push(NearDuplicate {
                        left: self.ids[left].clone(),
                        right: self.ids[right].clone(),
                        similarity,
                    });
                }
            }
        }
        pairs
    }
}

fn normalize_title(title: &str) -> String {
    let mut normalized = String::with_capacity(title.len());
    let mut last_space = true;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            normalized.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            normalized.push(' ');
            last_space = true;
        }
    }
    normalized.trim_end().to_string()
}

/// Extract the raw edges of one entity: header relationship fields plus
/// `[[target]]` body references (`[[target|display]]` keeps the target).
pub fn extract_edges(header: &Header, body: &str) -> Vec<RawEdge> {
    let mut edges: Vec<RawEdge> = Vec::new();
    let mut push = |target: &str, kind: EdgeKind| {
        let target = target.trim();
        if target.is_empty() {
            return;
        }
        let edge = RawEdge {
            target: target.to_string(),
            kind,
        };
        if !edges.contains(&edge) {
            edges.push(edge);
        }
    };

    for id in &header.links {
        push(id, EdgeKind::Link);
    }
    for id in &header.depends_on {
        push(id, EdgeKind::DependsOn);
    }
    for id in &header.blocks {
        push(id, EdgeKind::Blocks);
    }
    for id in &header.relates_to {
        push(id, EdgeKind::RelatesTo);
    }
    for capture in BODY_REF.captures_iter(body) {
        if let Some(inner) = capture.get(1) {
            let target = inner.as_str().split('|').next().unwrap_or_default();
            push(target, EdgeKind::Body);
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use kira_core::Kind;

    fn graph(dir: &Path) -> LinkGraph {
        LinkGraph::open(dir, 0.85).unwrap()
    }

    fn edge(target: &str, kind: EdgeKind) -> RawEdge {
        RawEdge {
            target: target.to_string(),
            kind,
        }
    }

    #[test]
    fn body_refs_are_extracted_with_display_stripped() {
        let mut header = Header::draft(Kind::Note, "n");
        header.links = vec!["task-1".to_string()];
        let body = "See [[note-2]] and [[note-3|the retro]].";
        let edges = extract_edges(&header, body);
        assert_eq!(
            edges,
            vec![
                edge("task-1", EdgeKind::Link),
                edge("note-2", EdgeKind::Body),
                edge("note-3", EdgeKind::Body),
            ]
        );
    }

    #[test]
    fn backlinks_resolve_by_id_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = AliasTable::load(dir.path()).unwrap();
        let mut g = graph(dir.path());
        g.on_entity_upsert("note-a", "Alpha", vec![]).unwrap();
        g.on_entity_upsert("note-b", "Beta", vec![edge("note-a", EdgeKind::Body)])
            .unwrap();
        g.on_entity_upsert("note-c", "Gamma", vec![edge("Alpha", EdgeKind::Body)])
            .unwrap();
        assert_eq!(g.query_backlinks("note-a", &aliases), vec!["note-b", "note-c"]);
    }

    #[test]
    fn delete_breaks_inbound_links_and_recreate_heals_them() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = AliasTable::load(dir.path()).unwrap();
        let mut g = graph(dir.path());
        g.on_entity_upsert("note-a", "Alpha", vec![]).unwrap();
        g.on_entity_upsert("note-b", "Beta", vec![edge("note-a", EdgeKind::Body)])
            .unwrap();
        assert_eq!(g.broken_count(&aliases), 0);

        g.on_entity_delete("note-a").unwrap();
        assert_eq!(g.broken_count(&aliases), 1);
        assert!(g.query_backlinks("note-a", &aliases).is_empty());

        g.on_entity_upsert("note-a", "Alpha", vec![]).unwrap();
        assert_eq!(g.broken_count(&aliases), 0);
        assert_eq!(g.query_backlinks("note-a", &aliases), vec!["note-b"]);
    }

    #[test]
    fn journal_replay_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut g = graph(dir.path());
            g.on_entity_upsert("note-a", "Alpha", vec![edge("note-b", EdgeKind::Body)])
                .unwrap();
            g.on_entity_upsert("note-b", "Beta", vec![]).unwrap();
            g.on_entity_delete("note-b").unwrap();
        }
        let aliases = AliasTable::load(dir.path()).unwrap();
        let mut g = graph(dir.path());
        assert!(g.contains("note-a"));
        assert!(!g.contains("note-b"));
        assert_eq!(g.broken_count(&aliases), 1);
    }

    #[test]
    fn corrupt_journal_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut g = graph(dir.path());
            g.on_entity_upsert("note-a", "Alpha", vec![]).unwrap();
        }
        let journal = dir.path().join(".state").join("link_journal.log");
        let mut contents = fs::read_to_string(&journal).unwrap();
        contents.push_str("garbage line\n");
        fs::write(&journal, contents).unwrap();
        let g = graph(dir.path());
        assert!(g.contains("note-a"));
    }

    #[test]
    fn compact_rewrites_journal_to_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = graph(dir.path());
        g.on_entity_upsert("note-a", "Alpha", vec![]).unwrap();
        g.on_entity_upsert("note-b", "Beta", vec![]).unwrap();
        g.on_entity_delete("note-b").unwrap();
        g.compact().unwrap();
        let journal = fs::read_to_string(dir.path().join(".state").join("link_journal.log")).unwrap();
        assert_eq!(journal.lines().count(), 1);
        assert!(journal.contains("note-a"));
    }

    #[test]
    fn cycles_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = AliasTable::load(dir.path()).unwrap();
        let mut g = graph(dir.path());
        g.on_entity_upsert("task-a", "A", vec![edge("task-b", EdgeKind::DependsOn)])
            .unwrap();
        g.on_entity_upsert("task-b", "B", vec![edge("task-c", EdgeKind::DependsOn)])
            .unwrap();
        g.on_entity_upsert("task-c", "C", vec![edge("task-a", EdgeKind::DependsOn)])
            .unwrap();
        let diagnosis = g.diagnose(&aliases);
        assert_eq!(diagnosis.cycles.len(), 1);
        assert_eq!(diagnosis.cycles[0].len(), 3);
    }

    #[test]
    fn orphans_and_near_duplicates_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = AliasTable::load(dir.path()).unwrap();
        let mut g = graph(dir.path());
        g.on_entity_upsert("note-a", "Weekly planning", vec![]).unwrap();
        g.on_entity_upsert("note-b", "Weekly planning!", vec![]).unwrap();
        g.on_entity_upsert("note-c", "Completely different topic", vec![])
            .unwrap();
        let diagnosis = g.diagnose(&aliases);
        assert!(diagnosis.orphans.contains(&"note-c".to_string()));
        assert_eq!(diagnosis.near_duplicates.len(), 1);
        assert_eq!(diagnosis.near_duplicates[0].left, "note-a");
    }

    #[test]
    fn aliases_keep_old_ids_resolving() {
        let dir = tempfile::tempdir().unwrap();
        let mut aliases = AliasTable::load(dir.path()).unwrap();
        let mut g = graph(dir.path());
        g.on_entity_upsert("note-new", "Renamed", vec![]).unwrap();
        g.on_entity_upsert("note-ref", "Referrer", vec![edge("note-old", EdgeKind::Body)])
            .unwrap();
        assert_eq!(g.broken_count(&aliases), 1);
        aliases.record_rename("note-old", "note-new").unwrap();
        // Resolution cache must observe the alias change.
        g.on_entity_upsert("note-ref", "Referrer", vec![edge("note-old", EdgeKind::Body)])
            .unwrap();
        assert_eq!(g.broken_count(&aliases), 0);
        assert_eq!(g.query_backlinks("note-new", &aliases), vec!["note-ref"]);
    }
}
