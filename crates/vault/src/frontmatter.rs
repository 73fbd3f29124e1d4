//! Deterministic YAML frontmatter codec.
//!
//! Serialization is hand-emitted so the same logical header always
//! yields byte-identical output: fixed canonical key order, block-style
//! sequences, a fixed quoting rule, timestamps in `+00:00` form.
//! Parsing goes through `serde_yaml` and is deliberately more lenient
//! (offsets are normalized, bare numbers in string positions are
//! stringified) so externally edited files still load.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use kira_core::error::{KiraError, Result};
use kira_core::time::{format_utc, parse_utc};
use kira_core::{EntityState, Header, SyncMeta};

const DOC_SEPARATOR: &str = "---";

/// Canonical order of the known header keys: identity, classification,
/// timestamps, relationships, then domain-specific keys alphabetically.
/// `x-sync` and unknown keys follow.
const TIMESTAMP_KEYS: [&str; 6] = [
    "created_ts",
    "updated_ts",
    "due_ts",
    "start_ts",
    "end_ts",
    "done_ts",
];
const RELATION_KEYS: [&str; 4] = ["links", "depends_on", "blocks", "relates_to"];

/// Render the full entity file: frontmatter, separator, body.
pub fn render_document(header: &Header, body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 512);
    out.push_str(DOC_SEPARATOR);
    out.push('\n');
    out.push_str(&serialize_header(header));
    out.push_str(DOC_SEPARATOR);
    out.push('\n');
    out.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Split an entity file into header and body and parse the header.
pub fn parse_document(raw: &str) -> Result<(Header, String)> {
    let rest = raw
        .strip_prefix("---\n")
        .ok_or_else(|| KiraError::Frontmatter("missing opening '---' line".to_string()))?;
    let (yaml, body) = rest
        .split_once("\n---\n")
        .map(|(y, b)| (y.to_string() + "\n", b.to_string()))
        .or_else(|| {
            // Header-only file: closing separator at EOF.
            rest.strip_suffix("\n---\n")
                .or_else(|| rest.strip_suffix("\n---"))
                .map(|y| (y.to_string() + "\n", String::new()))
        })
        .ok_or_else(|| KiraError::Frontmatter("missing closing '---' line".to_string()))?;
    let header = parse_header(&yaml)?;
    Ok((header, body))
}

/// Serialize just the header block (no separators), deterministically.
pub fn serialize_header(header: &Header) -> String {
    let mut out = String::with_capacity(512);

    emit_scalar(&mut out, 0, "id", &quote_if_needed(&header.id));
    emit_scalar(&mut out, 0, "title", &quote_if_needed(&header.title));
    emit_scalar(&mut out, 0, "state", header.state.slug());
    emit_string_seq(&mut out, 0, "tags", &header.tags, true);

    let timestamps: [(&str, Option<DateTime<Utc>>); 6] = [
        ("created_ts", Some(header.created_ts)),
        ("updated_ts", Some(header.updated_ts)),
        ("due_ts", header.due_ts),
        ("start_ts", header.start_ts),
        ("end_ts", header.end_ts),
        ("done_ts", header.done_ts),
    ];
    for (key, value) in timestamps {
        if let Some(ts) = value {
            emit_scalar(&mut out, 0, key, &format_utc(ts));
        }
    }

    emit_string_seq(&mut out, 0, "links", &header.links, false);
    emit_string_seq(&mut out, 0, "depends_on", &header.depends_on, false);
    emit_string_seq(&mut out, 0, "blocks", &header.blocks, false);
    emit_string_seq(&mut out, 0, "relates_to", &header.relates_to, false);

    // Domain-specific keys, alphabetical among themselves.
    if let Some(assignee) = &header.assignee {
        emit_scalar(&mut out, 0, "assignee", &quote_if_needed(assignee));
    }
    emit_string_seq(&mut out, 0, "attendees", &header.attendees, false);
    if let Some(reason) = &header.blocked_reason {
        emit_scalar(&mut out, 0, "blocked_reason", &quote_if_needed(reason));
    }
    if let Some(estimate) = &header.estimate {
        emit_scalar(&mut out, 0, "estimate", &quote_if_needed(estimate));
    }
    if let Some(frozen) = header.estimate_frozen {
        emit_scalar(&mut out, 0, "estimate_frozen", if frozen { "true" } else { "false" });
    }
    if let Some(location) = &header.location {
        emit_scalar(&mut out, 0, "location", &quote_if_needed(location));
    }
    if let Some(reason) = &header.reopen_reason {
        emit_scalar(&mut out, 0, "reopen_reason", &quote_if_needed(reason));
    }

    if let Some(sync) = &header.sync {
        out.push_str("x-sync:\n");
        if let Some(etag) = &sync.etag_seen {
            emit_scalar(&mut out, 1, "etag_seen", &quote_if_needed(etag));
        }
        if let Some(ts) = sync.last_write_ts {
            emit_scalar(&mut out, 1, "last_write_ts", &format_utc(ts));
        }
        emit_scalar(&mut out, 1, "remote_id", &quote_if_needed(&sync.remote_id));
        emit_scalar(&mut out, 1, "source", &quote_if_needed(&sync.source));
        if let Some(version) = &sync.version_seen {
            emit_scalar(&mut out, 1, "version_seen", &quote_if_needed(version));
        }
    }

    for (key, value) in &header.extra {
        emit_value(&mut out, 0, key, value);
    }

    out
}

/// Parse a header block emitted by [`serialize_header`] or written by hand.
pub fn parse_header(yaml: &str) -> Result<Header> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(yaml)
        .map_err(|err| KiraError::Frontmatter(format!("invalid YAML header: {err}")))?;

    let mut fields: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for (key, value) in mapping {
        let key = match key {
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(KiraError::Frontmatter(format!(
                    "non-string header key: {other:?}"
                )));
            }
        };
        order.push(key.clone());
        fields.insert(key, value);
    }

    let mut header = Header {
        id: take_string(&mut fields, "id")?.unwrap_or_default(),
        title: take_string(&mut fields, "title")?.unwrap_or_default(),
        ..Header::default()
    };

    if let Some(state) = take_string(&mut fields, "state")? {
        header.state = EntityState::from_slug(&state).ok_or_else(|| {
            KiraError::Frontmatter(format!("unknown state '{state}'"))
        })?;
    }
    header.tags = take_string_seq(&mut fields, "tags")?.unwrap_or_default();

    for key in TIMESTAMP_KEYS {
        let Some(raw) = take_string(&mut fields, key)? else {
            continue;
        };
        let ts = parse_utc(&raw)
            .map_err(|err| KiraError::Frontmatter(format!("{key}: {err}")))?;
        match key {
            "created_ts" => header.created_ts = ts,
            "updated_ts" => header.updated_ts = ts,
            "due_ts" => header.due_ts = Some(ts),
            "start_ts" => header.start_ts = Some(ts),
            "end_ts" => header.end_ts = Some(ts),
            _ => header.done_ts = Some(ts),
        }
    }

    for key in RELATION_KEYS {
        let Some(seq) = take_string_seq(&mut fields, key)? else {
            continue;
        };
        match key {
            "links" => header.links = seq,
            "depends_on" => header.depends_on = seq,
            "blocks" => header.blocks = seq,
            _ => header.relates_to = seq,
        }
    }

    header.assignee = take_string(&mut fields, "assignee")?;
    header.attendees = take_string_seq(&mut fields, "attendees")?.unwrap_or_default();
    header.blocked_reason = take_string(&mut fields, "blocked_reason")?;
    header.estimate = take_string(&mut fields, "estimate")?;
    if let Some(value) = fields.remove("estimate_frozen") {
        header.estimate_frozen = Some(value.as_bool().ok_or_else(|| {
            KiraError::Frontmatter("estimate_frozen must be a boolean".to_string())
        })?);
    }
    header.location = take_string(&mut fields, "location")?;
    header.reopen_reason = take_string(&mut fields, "reopen_reason")?;

    if let Some(value) = fields.remove("x-sync") {
        header.sync = Some(parse_sync_meta(value)?);
    }

    for key in order {
        if let Some(value) = fields.remove(&key) {
            header.extra.insert(key, yaml_to_json(value)?);
        }
    }

    Ok(header)
}

fn parse_sync_meta(value: serde_yaml::Value) -> Result<SyncMeta> {
    let serde_yaml::Value::Mapping(mapping) = value else {
        return Err(KiraError::Frontmatter("x-sync must be a map".to_string()));
    };
    let mut fields: BTreeMap<String, serde_yaml::Value> = BTreeMap::new();
    for (key, value) in mapping {
        if let serde_yaml::Value::String(key) = key {
            fields.insert(key, value);
        }
    }
    let mut meta = SyncMeta {
        source: take_string(&mut fields, "source")?.unwrap_or_default(),
        remote_id: take_string(&mut fields, "remote_id")?.unwrap_or_default(),
        version_seen: take_string(&mut fields, "version_seen")?,
        etag_seen: take_string(&mut fields, "etag_seen")?,
        last_write_ts: None,
    };
    if let Some(raw) = take_string(&mut fields, "last_write_ts")? {
        let ts = parse_utc(&raw)
            .map_err(|err| KiraError::Frontmatter(format!("x-sync.last_write_ts: {err}")))?;
        meta.last_write_ts = Some(ts);
    }
    if meta.source.is_empty() || meta.remote_id.is_empty() {
        return Err(KiraError::Frontmatter(
            "x-sync requires source and remote_id".to_string(),
        ));
    }
    Ok(meta)
}

// ── emission helpers ──────────────────────────────────────────────────────────

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn emit_scalar(out: &mut String, depth: usize, key: &str, rendered: &str) {
    indent(out, depth);
    out.push_str(key);
    out.push_str(": ");
    out.push_str(rendered);
    out.push('\n');
}

/// Block-style sequence of strings.  Required sequences emit `[]` when
/// empty (the only inline form YAML offers); optional ones are omitted
/// upstream.
fn emit_string_seq(out: &mut String, depth: usize, key: &str, items: &[String], required: bool) {
    if items.is_empty() {
        if required {
            indent(out, depth);
            out.push_str(key);
            out.push_str(": []\n");
        }
        return;
    }
    indent(out, depth);
    out.push_str(key);
    out.push_str(":\n");
    for item in items {
        indent(out, depth + 1);
        out.push_str("- ");
        out.push_str(&quote_if_needed(item));
        out.push('\n');
    }
}

/// Emit an unknown-key JSON value recursively under the same rules.
fn emit_value(out: &mut String, depth: usize, key: &str, value: &Value) {
    match value {
        Value::Null => emit_scalar(out, depth, key, "null"),
        Value::Bool(b) => emit_scalar(out, depth, key, if *b { "true" } else { "false" }),
        Value::Number(n) => emit_scalar(out, depth, key, &n.to_string()),
        Value::String(s) => emit_scalar(out, depth, key, &quote_if_needed(s)),
        Value::Array(items) => {
            if items.is_empty() {
                emit_scalar(out, depth, key, "[]");
                return;
            }
            indent(out, depth);
            out.push_str(key);
            out.push_str(":\n");
            for item in items {
                indent(out, depth + 1);
                out.push_str("- ");
                out.push_str(&render_inline(item));
                out.push('\n');
            }
        }
        Value::Object(map) => {
            if map.is_empty() {
                emit_scalar(out, depth, key, "{}");
                return;
            }
            indent(out, depth);
            out.push_str(key);
            out.push_str(":\n");
            for (k, v) in map {
                emit_value(out, depth + 1, k, v);
            }
        }
    }
}

/// Inline rendering for sequence items of unknown keys.  Nested
/// containers inside unknown sequences are rendered as JSON, which is
/// valid YAML flow style and round-trips.
fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => quote_if_needed(s),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// The fixed quoting rule: quote when the scalar contains one of the
/// special characters, leading/trailing whitespace, a wiki-style
/// `[[…]]`, or would parse as a non-string YAML scalar.
pub(crate) fn quote_if_needed(raw: &str) -> String {
    if needs_quotes(raw) {
        let mut quoted = String::with_capacity(raw.len() + 2);
        quoted.push('"');
        for ch in raw.chars() {
            match ch {
                '\\' => quoted.push_str("\\\\"),
                '"' => quoted.push_str("\\\""),
                '\n' => quoted.push_str("\\n"),
                '\t' => quoted.push_str("\\t"),
                other => quoted.push(other),
            }
        }
        quoted.push('"');
        quoted
    } else {
        raw.to_string()
    }
}

fn needs_quotes(raw: &str) -> bool {
    if raw.is_empty() {
        return true;
    }
    if raw.starts_with(char::is_whitespace) || raw.ends_with(char::is_whitespace) {
        return true;
    }
    if raw.contains("[[") {
        return true;
    }
    const SPECIALS: &[char] = &[
        ':', '#', '|', '>', '&', '*', '!', '%', '@', '[', '{', ']', '}', ',', '"', '\'', '\n',
        '\t',
    ];
    if raw.chars().any(|ch| SPECIALS.contains(&ch)) {
        return true;
    }
    if raw.starts_with('-') || raw.starts_with('?') {
        return true;
    }
    // Scalars YAML would type as something other than a string.
    if matches!(
        raw,
        "true" | "false" | "null" | "~" | "yes" | "no" | "on" | "off" | "True" | "False" | "Null"
    ) {
        return true;
    }
    raw.parse::<f64>().is_ok()
}

// ── parsing helpers ───────────────────────────────────────────────────────────

fn take_string(
    fields: &mut BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        // Hand-edited files may leave scalars unquoted; stringify.
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(KiraError::Frontmatter(format!(
            "{key} must be a scalar, got {other:?}"
        ))),
    }
}

fn take_string_seq(
    fields: &mut BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<Option<Vec<String>>> {
    match fields.remove(key) {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Sequence(items)) => {
            let mut seq = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_yaml::Value::String(s) => seq.push(s),
                    serde_yaml::Value::Number(n) => seq.push(n.to_string()),
                    other => {
                        return Err(KiraError::Frontmatter(format!(
                            "{key} items must be strings, got {other:?}"
                        )));
                    }
                }
            }
            Ok(Some(seq))
        }
        Some(other) => Err(KiraError::Frontmatter(format!(
            "{key} must be a sequence, got {other:?}"
        ))),
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<Value> {
    serde_json::to_value(&value)
        .map_err(|err| KiraError::Frontmatter(format!("unrepresentable header value: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kira_core::Kind;

    fn sample_header() -> Header {
        let created = Utc.with_ymd_and_hms(2025, 10, 8, 13, 42, 17).unwrap();
        let mut header = Header::draft(Kind::Task, "Review Q4 report");
        header.id = "task-20251008-1342-review-q4-report".to_string();
        header.created_ts = created;
        header.updated_ts = created;
        header.tags = vec!["work".to_string(), "q4".to_string()];
        header.links = vec!["note-20250901-0900-q3-retro".to_string()];
        header.estimate = Some("4h".to_string());
        header.sync = Some(SyncMeta {
            source: "calendar".to_string(),
            remote_id: "evt_778".to_string(),
            version_seen: Some("7".to_string()),
            etag_seen: Some("E7".to_string()),
            last_write_ts: Some(created),
        });
        header
            .extra
            .insert("zz_custom".to_string(), serde_json::json!("hello"));
        header
    }

    #[test]
    fn serialization_is_deterministic() {
        let header = sample_header();
        assert_eq!(serialize_header(&header), serialize_header(&header.clone()));
    }

    #[test]
    fn canonical_key_order() {
        let rendered = serialize_header(&sample_header());
        let keys: Vec<&str> = rendered
            .lines()
            .filter(|l| !l.starts_with(' ') && !l.starts_with('-'))
            .map(|l| l.split(':').next().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                "id",
                "title",
                "state",
                "tags",
                "created_ts",
                "updated_ts",
                "links",
                "estimate",
                "x-sync",
                "zz_custom"
            ]
        );
    }

    #[test]
    fn header_round_trip_both_directions() {
        let header = sample_header();
        let rendered = serialize_header(&header);
        let parsed = parse_header(&rendered).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(serialize_header(&parsed), rendered);
    }

    #[test]
    fn timestamps_end_with_utc_offset() {
        let rendered = serialize_header(&sample_header());
        for line in rendered.lines().filter(|l| l.contains("_ts:")) {
            assert!(line.ends_with("+00:00"), "line {line:?}");
        }
    }

    #[test]
    fn wiki_links_and_specials_are_quoted() {
        let mut header = sample_header();
        header.title = "See [[note-x]] for context: details".to_string();
        let rendered = serialize_header(&header);
        assert!(rendered.contains("title: \"See [[note-x]] for context: details\""));
        let parsed = parse_header(&rendered).unwrap();
        assert_eq!(parsed.title, header.title);
    }

    #[test]
    fn numeric_looking_strings_survive() {
        let mut header = sample_header();
        header.estimate = Some("90".to_string());
        let parsed = parse_header(&serialize_header(&header)).unwrap();
        assert_eq!(parsed.estimate.as_deref(), Some("90"));
    }

    #[test]
    fn document_round_trip_preserves_body() {
        let header = sample_header();
        let body = "Quarterly numbers live in [[note-20250901-0900-q3-retro]].\n";
        let doc = render_document(&header, body);
        let (parsed, parsed_body) = parse_document(&doc).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed_body, body);
        assert_eq!(render_document(&parsed, &parsed_body), doc);
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(parse_document("no frontmatter here").is_err());
        assert!(parse_document("---\nid: x\n").is_err());
    }

    #[test]
    fn naive_timestamp_is_rejected() {
        let yaml = "id: task-1\ntitle: x\nstate: todo\ntags: []\ncreated_ts: 2025-10-08T13:42:17\nupdated_ts: 2025-10-08T13:42:17+00:00\n";
        let err = parse_header(yaml).unwrap_err();
        assert!(matches!(err, KiraError::Frontmatter(_)));
    }

    #[test]
    fn empty_tags_render_as_empty_list() {
        let mut header = sample_header();
        header.tags.clear();
        let rendered = serialize_header(&header);
        assert!(rendered.contains("tags: []"));
        assert!(parse_header(&rendered).unwrap().tags.is_empty());
    }
}
