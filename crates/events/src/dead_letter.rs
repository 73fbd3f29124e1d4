//! Dead-letter sink for events that exhausted their retries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kira_core::{Envelope, now_utc};
use kira_vault::append_line;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub handler: String,
    pub attempts: u32,
    pub error: String,
    pub envelope: Envelope,
}

pub trait DeadLetterSink: Send + Sync {
    fn record(&self, envelope: &Envelope, handler: &str, error: &str, attempts: u32);
}

/// JSONL files under `artifacts/dead_letter/`, one per day.
#[derive(Debug, Clone)]
pub struct FileDeadLetter {
    dir: PathBuf,
}

impl FileDeadLetter {
    pub fn new(vault_root: &Path) -> Self {
        Self {
            dir: vault_root.join("artifacts").join("dead_letter"),
        }
    }
}

impl DeadLetterSink for FileDeadLetter {
    fn record(&self, envelope: &Envelope, handler: &str, error: &str, attempts: u32) {
        let record = DeadLetterRecord {
            ts: now_utc(),
            handler: handler.to_string(),
            attempts,
            error: error.to_string(),
            envelope: envelope.clone(),
        };
        let path = self.dir.join(format!("{}.jsonl", record.ts.format("%Y-%m-%d")));
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "unserializable dead-letter record dropped");
                return;
            }
        };
        if let Err(err) = append_line(&path, &line) {
            tracing::error!(
                path = %path.display(),
                error = %err,
                event_id = %record.envelope.event_id,
                "dead-letter append failed"
            );
        }
    }
}

/// Discards records; for tests and tools that do not care.
#[derive(Debug, Default)]
pub struct NullDeadLetter;

impl DeadLetterSink for NullDeadLetter {
    fn record(&self, envelope: &Envelope, handler: &str, error: &str, attempts: u32) {
        tracing::warn!(
            event_id = %envelope.event_id,
            handler,
            attempts,
            error,
            "event dead-lettered (null sink)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileDeadLetter::new(dir.path());
        let envelope = Envelope::new("chat", "message.received", serde_json::json!({}));
        sink.record(&envelope, "create-task", "boom", 5);

        let day_dir = dir.path().join("artifacts").join("dead_letter");
        let files: Vec<_> = std::fs::read_dir(day_dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(files.len(), 1);
        let contents = std::fs::read_to_string(files[0].path()).unwrap();
        let record: DeadLetterRecord = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record.attempts, 5);
        assert_eq!(record.envelope.event_id, envelope.event_id);
    }
}
