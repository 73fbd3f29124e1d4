//! Layered schema validation for entity headers.
//!
//! Layer 1 checks structural schema, layer 2 the kind-specific rules,
//! layer 3 the common business rules.  The FSM layer lives in
//! [`crate::fsm`] and only runs when a transition is applied.

use kira_core::{EntityState, Header, IssueCategory, Kind, ValidationIssue};

/// Validate `header` for `kind`; an empty list means valid.
pub fn validate(kind: Kind, header: &Header) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    schema_layer(kind, header, &mut issues);
    kind_layer(kind, header, &mut issues);
    common_layer(header, &mut issues);
    issues
}

fn schema_layer(kind: Kind, header: &Header, issues: &mut Vec<ValidationIssue>) {
    if header.id.is_empty() {
        issues.push(ValidationIssue::new(
            IssueCategory::Schema,
            "id",
            "id is required",
            "ids are assigned on create; do not clear them on update",
        ));
    } else if Kind::from_id(&header.id) != Some(kind) {
        issues.push(ValidationIssue::new(
            IssueCategory::Schema,
            "id",
            format!("id '{}' does not carry the '{}' prefix", header.id, kind.slug()),
            "entity ids start with their kind, e.g. 'task-20251008-1342-…'",
        ));
    }

    if !header.state.valid_for(kind) {
        issues.push(ValidationIssue::new(
            IssueCategory::Schema,
            "state",
            format!("state '{}' is not valid for kind '{}'", header.state, kind),
            match kind {
                Kind::Task => "tasks use todo/doing/review/done/blocked",
                Kind::Note | Kind::Event => "notes and events use active/archived",
            },
        ));
    }

    if let Some(sync) = &header.sync {
        if sync.source.is_empty() || sync.remote_id.is_empty() {
            issues.push(ValidationIssue::new(
                IssueCategory::Schema,
                "x-sync",
                "x-sync requires both source and remote_id",
                "drop the x-sync block for entities that are not mirrored",
            ));
        }
    }
}

fn kind_layer(kind: Kind, header: &Header, issues: &mut Vec<ValidationIssue>) {
    match kind {
        Kind::Task => task_layer(header, issues),
        Kind::Event => event_layer(header, issues),
        Kind::Note => {}
    }
}

fn task_layer(header: &Header, issues: &mut Vec<ValidationIssue>) {
    if header.state == EntityState::Blocked && none_or_blank(&header.blocked_reason) {
        issues.push(ValidationIssue::new(
            IssueCategory::Task,
            "blocked_reason",
            "blocked tasks need a blocked_reason",
            "pass a reason when transitioning into 'blocked'",
        ));
    }
    if header.state == EntityState::Done && header.done_ts.is_none() {
        issues.push(ValidationIssue::new(
            IssueCategory::Task,
            "done_ts",
            "done tasks need a done_ts",
            "transition through the FSM so done_ts is stamped automatically",
        ));
    }
    if let Some(estimate) = &header.estimate {
        if !estimate_is_well_formed(estimate) {
            issues.push(ValidationIssue::new(
                IssueCategory::Task,
                "estimate",
                format!("estimate '{estimate}' is malformed"),
                "use '<int>m', '<int>h', '<int>d', or a bare minute count",
            ));
        }
    }
    if let (Some(start), Some(done)) = (header.start_ts, header.done_ts) {
        if done < start {
            issues.push(ValidationIssue::new(
                IssueCategory::Task,
                "done_ts",
                "done_ts precedes start_ts",
                "completion cannot happen before work started",
            ));
        }
    }
}

fn event_layer(header: &Header, issues: &mut Vec<ValidationIssue>) {
    match (header.start_ts, header.end_ts) {
        (Some(start), Some(end)) if end < start => {
            issues.push(ValidationIssue::new(
                IssueCategory::Event,
                "end_ts",
                "end_ts precedes start_ts",
                "swap the interval endpoints",
            ));
        }
        _ => {}
    }
}

fn common_layer(header: &Header, issues: &mut Vec<ValidationIssue>) {
    if header.title.trim().is_empty() {
        issues.push(ValidationIssue::new(
            IssueCategory::Common,
            "title",
            "title must be non-empty",
            "give the entity a human-readable title",
        ));
    }
    if header.updated_ts < header.created_ts {
        issues.push(ValidationIssue::new(
            IssueCategory::Common,
            "updated_ts",
            "updated_ts precedes created_ts",
            "updated_ts is refreshed on every successful mutation",
        ));
    }
}

/// `<int>(m|h|d)` or a bare integer count of minutes.
pub fn estimate_is_well_formed(estimate: &str) -> bool {
    let estimate = estimate.trim();
    if estimate.is_empty() || !estimate.is_ascii() {
        return false;
    }
    if estimate.chars().all(|ch| ch.is_ascii_digit()) {
        return true;
    }
    let (digits, unit) = estimate.split_at(estimate.len() - 1);
    matches!(unit, "m" | "h" | "d")
        && !digits.is_empty()
        && digits.chars().all(|ch| ch.is_ascii_digit())
}

fn none_or_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kira_core::now_utc;

    fn valid_task() -> Header {
        let mut header = Header::draft(Kind::Task, "Ship the report");
        header.id = "task-20251008-1342-ship-the-report".to_string();
        header.created_ts = now_utc();
        header.updated_ts = header.created_ts;
        header
    }

    #[test]
    fn valid_task_has_no_issues() {
        assert!(validate(Kind::Task, &valid_task()).is_empty());
    }

    #[test]
    fn missing_title_is_a_common_issue() {
        let mut header = valid_task();
        header.title = "  ".to_string();
        let issues = validate(Kind::Task, &header);
        assert!(issues.iter().any(|i| i.category == IssueCategory::Common && i.field == "title"));
    }

    #[test]
    fn note_rejects_task_states() {
        let mut header = Header::draft(Kind::Note, "n");
        header.id = "note-20251008-1342-n".to_string();
        header.created_ts = now_utc();
        header.updated_ts = header.created_ts;
        header.state = EntityState::Doing;
        let issues = validate(Kind::Note, &header);
        assert!(issues.iter().any(|i| i.category == IssueCategory::Schema && i.field == "state"));
    }

    #[test]
    fn blocked_without_reason_is_rejected() {
        let mut header = valid_task();
        header.state = EntityState::Blocked;
        let issues = validate(Kind::Task, &header);
        assert!(issues.iter().any(|i| i.category == IssueCategory::Task && i.field == "blocked_reason"));
    }

    #[test]
    fn done_requires_done_ts() {
        let mut header = valid_task();
        header.state = EntityState::Done;
        let issues = validate(Kind::Task, &header);
        assert!(issues.iter().any(|i| i.field == "done_ts"));
    }

    #[test]
    fn event_interval_must_be_ordered() {
        let mut header = Header::draft(Kind::Event, "standup");
        header.id = "event-20251008-0900-standup".to_string();
        header.created_ts = now_utc();
        header.updated_ts = header.created_ts;
        header.start_ts = Some(header.created_ts);
        header.end_ts = Some(header.created_ts - chrono::Duration::hours(1));
        let issues = validate(Kind::Event, &header);
        assert!(issues.iter().any(|i| i.category == IssueCategory::Event));
    }

    #[test]
    fn estimate_formats() {
        for ok in ["90", "4h", "30m", "2d"] {
            assert!(estimate_is_well_formed(ok), "{ok}");
        }
        for bad in ["", "h", "4w", "4.5h", "h4"] {
            assert!(!estimate_is_well_formed(bad), "{bad}");
        }
    }

    #[test]
    fn updated_before_created_is_rejected() {
        let mut header = valid_task();
        header.updated_ts = header.created_ts - chrono::Duration::seconds(1);
        let issues = validate(Kind::Task, &header);
        assert!(issues.iter().any(|i| i.field == "updated_ts"));
    }
}
