//! Deterministic entity-id generation.
//!
//! Ids follow `{kind}-{YYYYMMDD}-{HHMM}-{slug}`; the slug is derived
//! from the title and a numeric suffix resolves collisions.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::entity::Kind;

/// Longest slug kept in an id.  Titles are truncated, never rejected.
const MAX_SLUG_LEN: usize = 40;

/// Lowercased, ASCII-only, hyphen-separated form of a title.
///
/// Punctuation collapses into single hyphens; an empty result falls
/// back to `untitled` so every entity gets a usable id.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen {
            slug.push('-');
            last_was_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    slug
}

/// Generate a unique id for a new entity.
///
/// Deterministic for a given `(kind, title, created_ts)`; when the
/// candidate already exists in `existing_ids` an incrementing `-2`,
/// `-3`, … suffix is appended until a free id is found.
pub fn generate_entity_id(
    kind: Kind,
    title: &str,
    created_ts: DateTime<Utc>,
    existing_ids: &HashSet<String>,
) -> String {
    let stamp = created_ts.format("%Y%m%d-%H%M");
    let base = format!("{}-{}-{}", kind.slug(), stamp, slugify(title));
    if !existing_ids.contains(&base) {
        return base;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing_ids.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
