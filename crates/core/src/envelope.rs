//! The standardized event record that travels on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::now_utc;

/// Well-known event type strings.
pub mod types {
    pub const ENTITY_CREATED: &str = "entity.created";
    pub const ENTITY_UPDATED: &str = "entity.updated";
    pub const ENTITY_DELETED: &str = "entity.deleted";
    pub const TASK_TRANSITIONED: &str = "task.transitioned";
    pub const MESSAGE_RECEIVED: &str = "message.received";
    pub const ENTITY_UPSERT_REQUESTED: &str = "entity.upsert_requested";
    pub const ENTITY_UPDATE_REQUESTED: &str = "entity.update_requested";
    pub const SYNC_REMOTE_CHANGED: &str = "sync.remote_changed";
    pub const ROLLUP_REQUESTED: &str = "rollup.requested";
    pub const MAINTENANCE_PURGE_REQUESTED: &str = "maintenance.purge_requested";
    pub const JOB_FIRED: &str = "job.fired";
}

/// Envelope carried by every producer and consumer on the bus.
///
/// `sync_origin` marks post-write events the Host emitted while applying
/// a sync import; the reconciler consults it to avoid re-pushing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub event_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync_origin: bool,
}

impl Envelope {
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_ts: now_utc(),
            seq: None,
            source: source.into(),
            event_type: event_type.into(),
            payload,
            trace_id: new_trace_id(),
            sync_origin: false,
        }
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.event_ts = ts;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_sync_origin(mut self, sync_origin: bool) -> Self {
        self.sync_origin = sync_origin;
        self
    }
}

/// Fresh correlation id, threaded through audit and quarantine records.
pub fn new_trace_id() -> String {
    format!("t-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serde_round_trip() {
        let env = Envelope::new("chat", types::MESSAGE_RECEIVED, serde_json::json!({"text": "hi"}))
            .with_seq(7);
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        // Wire name for the type field is `type`.
        assert!(json.contains("\"type\":\"message.received\""));
    }

    #[test]
    fn sync_origin_is_omitted_when_false() {
        let env = Envelope::new("host", types::ENTITY_CREATED, serde_json::json!({}));
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("sync_origin"));
        let flagged = env.with_sync_origin(true);
        assert!(serde_json::to_string(&flagged).unwrap().contains("\"sync_origin\":true"));
    }
}
