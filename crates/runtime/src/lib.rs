//! The Kira daemon runtime: composition of the vault Host, event bus,
//! idempotent ingress, calendar sync, rollups, and scheduler, plus the
//! filesystem inbox transport.

pub mod handlers;
pub mod inbox;
mod runtime;

pub use handlers::classify_message;
pub use inbox::{InboxWatcher, spawn_inbox_watcher};
pub use runtime::Runtime;
