//! Whole-engine scenarios: chat ingestion with dedup, inbox file drops,
//! and scheduler-driven sync against an in-memory calendar.

use std::sync::Arc;
use std::time::Duration;

use kira_config::AppConfig;
use kira_core::{Header, Kind, SyncMeta};
use kira_events::RawInbound;
use kira_runtime::Runtime;
use kira_sync::{CalendarProvider, InMemoryCalendar};
use kira_vault::WriteOptions;

fn test_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.vault.root = dir.path().to_string_lossy().to_string();
    config.time.timezone = "Europe/Brussels".to_string();
    // The clamp floor is 3s; tests poll rather than wait a full grace
    // window, so keep it at the minimum.
    config.bus.grace_secs = 3;
    config.bus.retry_initial_ms = 20;
    config.sync.enabled = true;
    config.sync.pull_interval_secs = 86_400;
    config
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_message_becomes_exactly_one_task() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(test_config(&dir), None).await.unwrap();
    let host = runtime.host();

    let raw = RawInbound {
        source: "chat".to_string(),
        external_id: "msg-100".to_string(),
        event_type: "message.received".to_string(),
        payload: serde_json::json!({"text": "TODO: Review Q4 report"}),
        event_ts: Some(kira_core::parse_utc("2025-10-08T13:42:17+00:00").unwrap()),
        seq: None,
    };
    assert!(runtime.normalizer().ingest(raw.clone()).unwrap().is_some());
    // The identical payload is a duplicate: dropped before the bus.
    assert!(runtime.normalizer().ingest(raw).unwrap().is_none());

    wait_for("task file", || {
        host.read("task-20251008-1342-review-q4-report").is_ok()
    })
    .await;

    let task = host.read("task-20251008-1342-review-q4-report").unwrap();
    assert_eq!(task.header.title, "Review Q4 report");
    assert_eq!(task.header.created_ts, task.header.updated_ts);
    assert!(task.header.tags.is_empty());
    assert_eq!(host.list(Some(Kind::Task)).unwrap().len(), 1);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbox_drop_is_ingested_and_archived() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Runtime::start(test_config(&dir), None).await.unwrap();
    let host = runtime.host();

    let drop_path = dir.path().join("inbox").join("meeting.md");
    std::fs::write(&drop_path, "Meeting notes from the planning call").unwrap();

    wait_for("note from inbox drop", || {
        host.list(Some(Kind::Note)).map(|n| n.len()).unwrap_or(0) == 1
    })
    .await;
    wait_for("drop archived", || {
        dir.path().join("inbox").join("processed").join("meeting.md").exists()
    })
    .await;
    assert!(!drop_path.exists());

    let notes = host.list(Some(Kind::Note)).unwrap();
    assert_eq!(notes[0].header.title, "Meeting notes from the planning call");

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_cycle_event_pulls_and_pushes() {
    let dir = tempfile::tempdir().unwrap();
    let calendar = Arc::new(InMemoryCalendar::new());
    let provider: Arc<dyn CalendarProvider> = calendar.clone();
    let runtime = Runtime::start(test_config(&dir), Some(provider))
        .await
        .unwrap();
    let host = runtime.host();

    // A locally mirrored event, dirty because it was never pushed.
    let mut header = Header::draft(Kind::Event, "Architecture review");
    header.sync = Some(SyncMeta {
        source: "calendar".to_string(),
        remote_id: "evt_42".to_string(),
        version_seen: None,
        etag_seen: None,
        last_write_ts: None,
    });
    host.create(Kind::Event, header, "", &WriteOptions::default())
        .unwrap();

    let reconciler = runtime.reconciler().expect("sync enabled");
    let summary = reconciler.run_cycle().await.unwrap();
    assert_eq!(summary.push.pushed, 1);
    assert_eq!(calendar.pushed().len(), 1);

    // A second cycle has nothing new on either side.
    let summary = reconciler.run_cycle().await.unwrap();
    assert_eq!(summary.push.pushed, 0);

    runtime.shutdown().await;
}
