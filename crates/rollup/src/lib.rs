//! Day/week rollups over validated entities, using DST-correct windows.
//!
//! A rollup aggregates whatever instants fall inside the UTC projection
//! of a civil day or Monday-based week: events in the window, tasks
//! completed or due in it, tasks currently in progress, and tag counts.
//! Entities that fail validation never contribute; they surface only as
//! a quarantined count.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use kira_core::error::Result;
use kira_core::{CivilWindow, EntityState, Kind, day_window, format_utc, week_window};
use kira_vault::{Host, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupScope {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollupDoc {
    pub scope: RollupScope,
    pub date: NaiveDate,
    pub zone: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub dst_transition: bool,
    pub events_in_window: Vec<RollupItem>,
    pub tasks_completed: Vec<RollupItem>,
    pub tasks_in_progress: Vec<RollupItem>,
    pub tasks_due: Vec<RollupItem>,
    pub counts_by_tag: BTreeMap<String, usize>,
    pub quarantined: usize,
}

pub struct RollupEngine {
    host: Arc<Host>,
}

impl RollupEngine {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }

    pub fn daily(&self, date: NaiveDate, zone: Tz) -> Result<RollupDoc> {
        self.build(RollupScope::Daily, date, zone, day_window(date, zone))
    }

    pub fn weekly(&self, date: NaiveDate, zone: Tz) -> Result<RollupDoc> {
        self.build(RollupScope::Weekly, date, zone, week_window(date, zone))
    }

    fn build(
        &self,
        scope: RollupScope,
        date: NaiveDate,
        zone: Tz,
        window: CivilWindow,
    ) -> Result<RollupDoc> {
        let mut doc = RollupDoc {
            scope,
            date,
            zone: zone.name().to_string(),
            window_start: window.utc_start,
            window_end: window.utc_end,
            dst_transition: window.dst_transition,
            events_in_window: Vec::new(),
            tasks_completed: Vec::new(),
            tasks_in_progress: Vec::new(),
            tasks_due: Vec::new(),
            counts_by_tag: BTreeMap::new(),
            quarantined: 0,
        };

        for entity in self.host.list(None)? {
            if !validate(entity.kind, &entity.header).is_empty() {
                doc.quarantined += 1;
                continue;
            }

            let header = &entity.header;
            let mut relevant = false;
            match entity.kind {
                Kind::Event => {
                    if header.start_ts.is_some_and(|ts| window.contains(ts)) {
                        doc.events_in_window.push(item(&entity, header.start_ts));
                        relevant = true;
                    }
                }
                Kind::Task => {
                    if header.done_ts.is_some_and(|ts| window.contains(ts)) {
                        doc.tasks_completed.push(item(&entity, header.done_ts));
                        relevant = true;
                    }
                    if header.state == EntityState::Doing {
                        doc.tasks_in_progress.push(item(&entity, header.start_ts));
                        relevant = true;
                    }
                    if header.due_ts.is_some_and(|ts| window.contains(ts)) {
                        doc.tasks_due.push(item(&entity, header.due_ts));
                        relevant = true;
                    }
                }
                Kind::Note => {}
            }

            if relevant {
                for tag in &header.tags {
                    *doc.counts_by_tag.entry(tag.clone()).or_default() += 1;
                }
            }
        }

        for section in [
            &mut doc.events_in_window,
            &mut doc.tasks_completed,
            &mut doc.tasks_in_progress,
            &mut doc.tasks_due,
        ] {
            section.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
        }
        Ok(doc)
    }
}

fn item(entity: &kira_core::Entity, ts: Option<DateTime<Utc>>) -> RollupItem {
    RollupItem {
        id: entity.header.id.clone(),
        title: entity.header.title.clone(),
        ts,
    }
}

/// Render the fixed-section Markdown form of a rollup.
pub fn render_markdown(doc: &RollupDoc) -> String {
    let heading = match doc.scope {
        RollupScope::Daily => format!("# Daily rollup {}", doc.date),
        RollupScope::Weekly => format!("# Weekly rollup (week of {})", doc.date),
    };

    let mut out = String::new();
    out.push_str(&heading);
    out.push('\n');
    out.push('\n');
    out.push_str(&format!(
        "Window: {} .. {} ({})\n",
        format_utc(doc.window_start),
        format_utc(doc.window_end),
        doc.zone
    ));
    if doc.dst_transition {
        let hours = (doc.window_end - doc.window_start).num_hours();
        out.push_str(&format!(
            "Note: this window crosses a DST transition ({hours}h).\n"
        ));
    }

    section(&mut out, "Events", &doc.events_in_window);
    section(&mut out, "Tasks completed", &doc.tasks_completed);
    section(&mut out, "Tasks in progress", &doc.tasks_in_progress);
    section(&mut out, "Tasks due", &doc.tasks_due);

    out.push_str("\n## Tags\n");
    if doc.counts_by_tag.is_empty() {
        out.push_str("(none)\n");
    } else {
        for (tag, count) in &doc.counts_by_tag {
            out.push_str(&format!("- {tag} ({count})\n"));
        }
    }

    if doc.quarantined > 0 {
        out.push_str(&format!(
            "\n## Quarantined\n{} entities failed validation and were excluded.\n",
            doc.quarantined
        ));
    }
    out
}

fn section(out: &mut String, title: &str, items: &[RollupItem]) {
    out.push_str(&format!("\n## {title}\n"));
    if items.is_empty() {
        out.push_str("(none)\n");
        return;
    }
    for item in items {
        match item.ts {
            Some(ts) => out.push_str(&format!("- [[{}]] {} ({})\n", item.id, item.title, format_utc(ts))),
            None => out.push_str(&format!("- [[{}]] {}\n", item.id, item.title)),
        }
    }
}
