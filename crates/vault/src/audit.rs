//! Append-only JSONL audit stream under `artifacts/audit/`.
//!
//! One record per significant operation, correlatable by trace id.
//! Audit failures are logged and swallowed; observability must never
//! take the write path down.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kira_core::{format_utc, now_utc};

use crate::writer::append_line;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub trace_id: String,
    pub operation: String,
    /// Entity id or event id the operation concerned, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// `ok` or a concise error code (`validation_failed`, …).
    pub outcome: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct AuditTrail {
    dir: PathBuf,
}

impl AuditTrail {
    pub fn new(vault_root: &Path) -> Self {
        Self {
            dir: vault_root.join("artifacts").join("audit"),
        }
    }

    pub fn success(
        &self,
        operation: &str,
        subject: Option<&str>,
        trace_id: &str,
        duration_ms: u64,
    ) {
        self.write(AuditRecord {
            ts: now_utc(),
            trace_id: trace_id.to_string(),
            operation: operation.to_string(),
            subject: subject.map(str::to_string),
            outcome: "ok".to_string(),
            duration_ms,
            error: None,
        });
    }

    pub fn failure(
        &self,
        operation: &str,
        subject: Option<&str>,
        trace_id: &str,
        duration_ms: u64,
        code: &str,
        error: serde_json::Value,
    ) {
        self.write(AuditRecord {
            ts: now_utc(),
            trace_id: trace_id.to_string(),
            operation: operation.to_string(),
            subject: subject.map(str::to_string),
            outcome: code.to_string(),
            duration_ms,
            error: Some(error),
        });
    }

    /// Count-style records (duplicate drops, conflict resolutions) reuse
    /// the same stream with a zero duration.
    pub fn note(&self, operation: &str, subject: Option<&str>, trace_id: &str, outcome: &str) {
        self.write(AuditRecord {
            ts: now_utc(),
            trace_id: trace_id.to_string(),
            operation: operation.to_string(),
            subject: subject.map(str::to_string),
            outcome: outcome.to_string(),
            duration_ms: 0,
            error: None,
        });
    }

    fn write(&self, record: AuditRecord) {
        let path = self.dir.join(format!("{}.jsonl", record.ts.format("%Y-%m-%d")));
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "unserializable audit record dropped");
                return;
            }
        };
        if let Err(err) = append_line(&path, &line) {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                ts = %format_utc(record.ts),
                "audit append failed"
            );
        }
    }
}
