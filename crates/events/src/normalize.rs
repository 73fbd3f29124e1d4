//! Ingress normalization: raw inbound payloads become envelopes.
//!
//! Every raw payload is fingerprinted over `(source, external_id,
//! canonical_json(payload))`; the idempotency store gates publication so
//! redelivered payloads are silently dropped (and counted in the audit
//! stream).

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use kira_core::error::{KiraError, Result};
use kira_core::{Envelope, new_trace_id, now_utc};
use kira_vault::AuditTrail;

use crate::bus::EventBus;
use crate::idempotency::IdempotencyStore;

/// A payload as handed over by an ingress transport (chat bot, calendar
/// pull, inbox file drop) before normalization.
#[derive(Debug, Clone)]
pub struct RawInbound {
    pub source: String,
    pub external_id: String,
    /// Dotted event type the envelope will carry, e.g. `message.received`.
    pub event_type: String,
    pub payload: serde_json::Value,
    pub event_ts: Option<DateTime<Utc>>,
    pub seq: Option<u64>,
}

/// Key-sorted, whitespace-free JSON rendering.  Map ordering and
/// insignificant formatting differences do not change the fingerprint.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// `sha256(source ∥ external_id ∥ canonical_json(payload))`, hex.
pub fn fingerprint(source: &str, external_id: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(external_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct IngressNormalizer {
    bus: EventBus,
    // Mutex rather than bare Arc: the scheduler's maintenance job needs
    // exclusive access for redb compaction.
    store: Arc<Mutex<IdempotencyStore>>,
    audit: AuditTrail,
}

impl IngressNormalizer {
    pub fn new(bus: EventBus, store: Arc<Mutex<IdempotencyStore>>, audit: AuditTrail) -> Self {
        Self { bus, store, audit }
    }

    /// Normalize and publish one raw payload.
    ///
    /// Returns the published event id, or `None` when the fingerprint
    /// was already seen (a silent no-op per the delivery contract).
    pub fn ingest(&self, raw: RawInbound) -> Result<Option<String>> {
        let trace_id = new_trace_id();
        let digest = fingerprint(&raw.source, &raw.external_id, &raw.payload);

        let fresh = self
            .store
            .lock()
            .map_err(|_| KiraError::Storage("idempotency store lock poisoned".to_string()))?
            .first_sighting(&digest)?;
        if !fresh {
            tracing::debug!(
                source = %raw.source,
                external_id = %raw.external_id,
                fingerprint = %digest,
                "duplicate ingress payload dropped"
            );
            self.audit.note(
                "ingress.dedup",
                Some(&raw.external_id),
                &trace_id,
                "duplicate_event",
            );
            return Ok(None);
        }

        let mut envelope = Envelope::new(raw.source, raw.event_type, raw.payload)
            .with_trace(trace_id)
            .with_ts(raw.event_ts.unwrap_or_else(now_utc));
        if let Some(seq) = raw.seq {
            envelope = envelope.with_seq(seq);
        }
        let event_id = envelope.event_id.clone();
        self.bus.publish(envelope)?;
        Ok(Some(event_id))
    }
}
