//! Two-way calendar sync: the durable ledger, the provider contract,
//! and the echo-suppressing latest-wins reconciler.

pub mod ledger;
pub mod provider;
pub mod reconcile;

pub use ledger::{LedgerEntry, SyncLedger};
pub use provider::{CalendarProvider, InMemoryCalendar, RemoteAck, RemoteChange};
pub use reconcile::{
    CycleSummary, PullSummary, PushSummary, Reconciler, ReconcilerOptions, is_echo, resolve,
    should_import,
};
