//! Contract with the external calendar collaborator.
//!
//! The concrete HTTP client lives outside the core; the reconciler only
//! sees this trait.  An in-memory double ships for tests and offline
//! use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kira_core::Entity;
use kira_core::error::Result;

/// One changed record as reported by the remote calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub remote_id: String,
    /// Remote revision counter, when the provider exposes one.
    pub version: Option<String>,
    pub etag: Option<String>,
    pub title: String,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub attendees: Vec<String>,
    pub body: String,
    /// Remote-side modification instant; feeds latest-wins resolution.
    pub last_modified: DateTime<Utc>,
    /// True when the remote deleted the record.
    pub deleted: bool,
}

/// Acknowledgement returned by a successful push.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAck {
    pub version: Option<String>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Fetch remote changes since whatever watermark the provider keeps.
    async fn pull(&self) -> Result<Vec<RemoteChange>>;

    /// Push one local entity outward; the ack carries the new remote
    /// version/etag.
    async fn push(&self, entity: &Entity) -> Result<RemoteAck>;
}

/// In-memory calendar double: a mutable change feed plus a push log.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    changes: std::sync::Mutex<Vec<RemoteChange>>,
    pushed: std::sync::Mutex<Vec<(String, RemoteAck)>>,
    next_version: std::sync::atomic::AtomicU64,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self {
            next_version: std::sync::atomic::AtomicU64::new(1),
            ..Self::default()
        }
    }

    pub fn stage(&self, change: RemoteChange) {
        if let Ok(mut changes) = self.changes.lock() {
            changes.push(change);
        }
    }

    /// Entity ids pushed so far, with the acks they received.
    pub fn pushed(&self) -> Vec<(String, RemoteAck)> {
        self.pushed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CalendarProvider for InMemoryCalendar {
    async fn pull(&self) -> Result<Vec<RemoteChange>> {
        Ok(self.changes.lock().map(|c| c.clone()).unwrap_or_default())
    }

    async fn push(&self, entity: &Entity) -> Result<RemoteAck> {
        let version = self
            .next_version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let ack = RemoteAck {
            version: Some(version.to_string()),
            etag: Some(format!("E{version}")),
        };
        if let Ok(mut pushed) = self.pushed.lock() {
            pushed.push((entity.header.id.clone(), ack.clone()));
        }
        Ok(ack)
    }
}
