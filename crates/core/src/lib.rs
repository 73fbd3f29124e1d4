//! Shared domain model for the Kira knowledge/task engine: entity kinds
//! and headers, UTC time discipline, id generation, the bus envelope,
//! and the error taxonomy.

pub mod entity;
pub mod envelope;
pub mod error;
pub mod id;
pub mod time;

pub use entity::{Entity, EntityState, Header, Kind, SyncMeta, entity_path};
pub use envelope::{Envelope, new_trace_id};
pub use error::{ConflictWinner, IssueCategory, KiraError, Result, ValidationIssue};
pub use id::{generate_entity_id, slugify};
pub use time::{CivilWindow, day_window, format_utc, now_utc, parse_utc, parse_zone, week_window};
