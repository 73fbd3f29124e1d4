//! Task/Note/Event state machines.
//!
//! A successful transition returns the mutated header with its guarded
//! fields applied; a guard failure returns [`KiraError::Fsm`] and the
//! caller must leave disk untouched.

use chrono::{DateTime, Utc};

use kira_core::error::{KiraError, Result};
use kira_core::{EntityState, Header, Kind};

use EntityState::*;

/// Apply `to` to a copy of `header`, enforcing the transition table.
///
/// `reason` feeds `blocked_reason` (transitions into `blocked`) and
/// `reopen_reason` (`done -> doing`).  `now` stamps `start_ts`/`done_ts`
/// where the table requires it.
pub fn apply_transition(
    kind: Kind,
    header: &Header,
    to: EntityState,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Header> {
    let from = header.state;
    if from == to {
        return Err(guard_error(from, to, "entity is already in that state"));
    }
    match kind {
        Kind::Task => task_transition(header, to, reason, now),
        Kind::Note | Kind::Event => doc_transition(header, to),
    }
}

fn task_transition(
    header: &Header,
    to: EntityState,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Header> {
    let from = header.state;
    let mut next = header.clone();
    next.state = to;

    match (from, to) {
        (Todo, Doing) => {
            // Guarded on assignee-or-start_ts, but the missing field is
            // supplied instead of rejecting.
            if next.assignee.is_none() && next.start_ts.is_none() {
                next.start_ts = Some(now);
            }
        }
        (Todo, Blocked) => {
            let reason = non_blank(reason)
                .ok_or_else(|| guard_error(from, to, "blocking a task requires a reason"))?;
            next.blocked_reason = Some(reason.to_string());
        }
        (Doing, Blocked) | (Review, Blocked) => {
            if let Some(reason) = non_blank(reason) {
                next.blocked_reason = Some(reason.to_string());
            }
        }
        (Todo, Done) | (Doing, Done) | (Review, Done) => {
            if next.done_ts.is_none() {
                next.done_ts = Some(now);
            }
            next.estimate_frozen = Some(true);
        }
        (Doing, Review) | (Review, Doing) => {}
        (Blocked, Todo) | (Blocked, Doing) => {
            next.blocked_reason = None;
        }
        (Done, Doing) => {
            let reason = non_blank(reason)
                .ok_or_else(|| guard_error(from, to, "reopening requires a reopen_reason"))?;
            next.reopen_reason = Some(reason.to_string());
            next.done_ts = None;
        }
        _ => {
            return Err(guard_error(from, to, "transition not in the task state machine"));
        }
    }

    Ok(next)
}

fn doc_transition(header: &Header, to: EntityState) -> Result<Header> {
    let from = header.state;
    match (from, to) {
        (Active, Archived) | (Archived, Active) => {
            let mut next = header.clone();
            next.state = to;
            Ok(next)
        }
        _ => Err(guard_error(from, to, "notes and events only move between active and archived")),
    }
}

fn guard_error(from: EntityState, to: EntityState, reason: &str) -> KiraError {
    KiraError::Fsm {
        from,
        to,
        reason: reason.to_string(),
    }
}

fn non_blank(reason: Option<&str>) -> Option<&str> {
    reason.map(str::trim).filter(|r| !r.is_empty())
}
