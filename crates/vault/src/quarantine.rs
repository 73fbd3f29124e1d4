//! Persistence of rejected inputs under `artifacts/quarantine/`.
//!
//! Every `ValidationError` and `FsmError` produces exactly one record:
//! the offending payload, the validator's issue list, and the
//! correlation id.  Entity files are never touched on the rejection
//! path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kira_core::error::Result;
use kira_core::{Kind, ValidationIssue, now_utc};

use crate::writer::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub ts: DateTime<Utc>,
    pub trace_id: String,
    pub kind: Kind,
    /// Concise error code (`validation_failed`, `fsm_guard_failed`).
    pub reason: String,
    pub errors: Vec<ValidationIssue>,
    /// The rejected input, verbatim.
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Quarantine {
    dir: PathBuf,
}

impl Quarantine {
    pub fn new(vault_root: &Path) -> Self {
        Self {
            dir: vault_root.join("artifacts").join("quarantine"),
        }
    }

    /// Write one record and return its path.
    pub fn persist(&self, record: &QuarantineRecord) -> Result<PathBuf> {
        let file_name = format!(
            "{}-{}-{}.json",
            record.ts.format("%Y%m%dT%H%M%S"),
            record.trace_id,
            record.kind.slug()
        );
        let path = self.dir.join(file_name);
        let rendered = serde_json::to_string_pretty(record)
            .map_err(|err| kira_core::KiraError::Storage(err.to_string()))?;
        atomic_write(&path, rendered.as_bytes())?;
        Ok(path)
    }
}

impl QuarantineRecord {
    pub fn new(
        kind: Kind,
        trace_id: &str,
        reason: &str,
        errors: Vec<ValidationIssue>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            ts: now_utc(),
            trace_id: trace_id.to_string(),
            kind,
            reason: reason.to_string(),
            errors,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kira_core::IssueCategory;

    #[test]
    fn persists_payload_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let quarantine = Quarantine::new(dir.path());
        let record = QuarantineRecord::new(
            Kind::Task,
            "t-q1",
            "validation_failed",
            vec![ValidationIssue::new(
                IssueCategory::Common,
                "title",
                "title must be non-empty",
                "give the entity a title",
            )],
            serde_json::json!({"title": ""}),
        );
        let path = quarantine.persist(&record).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().contains("t-q1"));
        let back: QuarantineRecord =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.reason, "validation_failed");
        assert_eq!(back.errors.len(), 1);
        assert_eq!(back.payload["title"], "");
    }
}
