//! Reconciler scenarios: echo suppression, latest-wins conflicts,
//! non-oscillation of push/pull, remote deletion, and startup ledger
//! reconciliation.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use kira_config::HostConfig;
use kira_core::{ConflictWinner, EntityState, Header, Kind, SyncMeta};
use kira_sync::{
    InMemoryCalendar, LedgerEntry, Reconciler, ReconcilerOptions, RemoteChange, SyncLedger,
    is_echo, resolve, should_import,
};
use kira_vault::{AuditTrail, Host, NullEmitter, WriteOptions};

struct Fixture {
    _dir: tempfile::TempDir,
    host: Arc<Host>,
    ledger: Arc<SyncLedger>,
    calendar: Arc<InMemoryCalendar>,
    reconciler: Reconciler,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(
            Host::open(dir.path(), &HostConfig::default(), Box::new(NullEmitter)).unwrap(),
        );
        let ledger = Arc::new(
            SyncLedger::open(dir.path().join(".state").join("sync_ledger.db")).unwrap(),
        );
        let calendar = Arc::new(InMemoryCalendar::new());
        let reconciler = Reconciler::new(
            host.clone(),
            ledger.clone(),
            calendar.clone(),
            AuditTrail::new(dir.path()),
            ReconcilerOptions {
                source: "calendar".to_string(),
                source_priority: 10,
            },
        );
        Self {
            _dir: dir,
            host,
            ledger,
            calendar,
            reconciler,
        }
    }

    fn mirrored_event(&self, remote_id: &str) -> kira_core::Entity {
        let mut header = Header::draft(Kind::Event, "Quarterly planning");
        header.sync = Some(SyncMeta {
            source: "calendar".to_string(),
            remote_id: remote_id.to_string(),
            version_seen: None,
            etag_seen: None,
            last_write_ts: None,
        });
        self.host
            .create(Kind::Event, header, "", &WriteOptions::default())
            .unwrap()
    }
}

fn change(remote_id: &str, version: &str, etag: &str) -> RemoteChange {
    RemoteChange {
        remote_id: remote_id.to_string(),
        version: Some(version.to_string()),
        etag: Some(etag.to_string()),
        title: "Quarterly planning".to_string(),
        start_ts: None,
        end_ts: None,
        location: None,
        attendees: Vec::new(),
        body: String::new(),
        last_modified: kira_core::now_utc(),
        deleted: false,
    }
}

#[test]
fn echo_detection_requires_matching_recorded_state() {
    let entry = LedgerEntry {
        entity_id: "event-x".to_string(),
        version_seen: Some("7".to_string()),
        etag_seen: Some("E7".to_string()),
        last_sync_ts: None,
        last_write_ts_local: None,
        last_write_ts_remote: None,
    };
    assert!(is_echo(Some(&entry), Some("7"), Some("E7")));
    assert!(!is_echo(Some(&entry), Some("8"), Some("E8")));
    assert!(!is_echo(None, Some("7"), Some("E7")));
    // Comparison degrades to the fields the remote supplied.
    assert!(is_echo(Some(&entry), Some("7"), None));
    assert!(is_echo(Some(&entry), None, Some("E7")));
    assert!(!is_echo(Some(&entry), None, None));

    assert!(should_import(Some(&entry), Some("8"), Some("E8")));
    assert!(!should_import(Some(&entry), Some("7"), Some("E7")));
    assert!(should_import(None, Some("1"), None));
}

#[test]
fn resolve_is_latest_wins_with_deterministic_ties() {
    let early = Utc.with_ymd_and_hms(2025, 10, 8, 10, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2025, 10, 8, 10, 5, 0).unwrap();
    assert_eq!(resolve(late, early, "event-x", "evt_1", 10), ConflictWinner::Local);
    assert_eq!(resolve(early, late, "event-x", "evt_1", 10), ConflictWinner::Remote);
    // Equal instants: local rank (0) sorts first, so the tie stands.
    assert_eq!(resolve(early, early, "event-x", "evt_1", 10), ConflictWinner::Tie);
}

#[tokio::test]
async fn push_then_pull_suppresses_echo() {
    let fx = Fixture::new();
    fx.mirrored_event("evt_778");

    let push = fx.reconciler.push().await.unwrap();
    assert_eq!(push.pushed, 1);
    let recorded = fx.ledger.get("calendar", "evt_778").unwrap().unwrap();
    let version = recorded.version_seen.clone().unwrap();
    let etag = recorded.etag_seen.clone().unwrap();

    // The remote now reports exactly what we pushed.
    fx.calendar.stage(change("evt_778", &version, &etag));
    let pull = fx.reconciler.pull().await.unwrap();
    assert_eq!(pull.echoes, 1);
    assert_eq!(pull.imported, 0);

    // Ledger untouched by the echo.
    let after = fx.ledger.get("calendar", "evt_778").unwrap().unwrap();
    assert_eq!(after.last_write_ts_local, recorded.last_write_ts_local);
}

#[tokio::test]
async fn converged_state_does_not_oscillate() {
    let fx = Fixture::new();
    let entity = fx.mirrored_event("evt_778");

    // Local edit, then push.
    fx.host
        .update(
            entity.id(),
            &kira_vault::HeaderPatch {
                tags: Some(vec!["planning".to_string()]),
                ..kira_vault::HeaderPatch::default()
            },
            None,
            &WriteOptions::default(),
        )
        .unwrap();
    fx.reconciler.run_cycle().await.unwrap();
    assert_eq!(fx.calendar.pushed().len(), 1);

    // Remote echoes the push back; a second cycle must not push again.
    let recorded = fx.ledger.get("calendar", "evt_778").unwrap().unwrap();
    fx.calendar.stage(change(
        "evt_778",
        recorded.version_seen.as_deref().unwrap(),
        recorded.etag_seen.as_deref().unwrap(),
    ));
    let summary = fx.reconciler.run_cycle().await.unwrap();
    assert_eq!(summary.pull.echoes, 1);
    assert_eq!(summary.push.pushed, 0);
    assert_eq!(fx.calendar.pushed().len(), 1);
}

#[tokio::test]
async fn remote_advance_imports_and_remote_wins_conflict() {
    let fx = Fixture::new();
    let entity = fx.mirrored_event("evt_778");
    fx.reconciler.push().await.unwrap();

    // Remote advanced with a strictly later modification instant.
    let mut remote = change("evt_778", "8", "E8");
    remote.title = "Quarterly planning (moved)".to_string();
    remote.last_modified = kira_core::now_utc() + Duration::minutes(5);
    fx.calendar.stage(remote);

    let summary = fx.reconciler.run_cycle().await.unwrap();
    assert_eq!(summary.pull.imported, 1);
    // The import is sync-origin: it must not be pushed back out.
    assert_eq!(summary.push.pushed, 0);
    assert_eq!(fx.calendar.pushed().len(), 1);

    let local = fx.host.read(entity.id()).unwrap();
    assert_eq!(local.header.title, "Quarterly planning (moved)");
    let recorded = fx.ledger.get("calendar", "evt_778").unwrap().unwrap();
    assert_eq!(recorded.version_seen.as_deref(), Some("8"));
}

#[tokio::test]
async fn stale_remote_loses_and_is_not_reimported() {
    let fx = Fixture::new();
    let entity = fx.mirrored_event("evt_778");
    fx.reconciler.push().await.unwrap();

    // Remote reports an older change than the local edit below.
    let mut remote = change("evt_778", "9", "E9");
    remote.title = "Stale remote title".to_string();
    remote.last_modified = kira_core::now_utc() - Duration::hours(1);
    fx.calendar.stage(remote);

    fx.host
        .update(
            entity.id(),
            &kira_vault::HeaderPatch {
                title: Some("Fresh local title".to_string()),
                ..kira_vault::HeaderPatch::default()
            },
            None,
            &WriteOptions::default(),
        )
        .unwrap();

    let pull = fx.reconciler.pull().await.unwrap();
    assert_eq!(pull.local_wins, 1);
    assert_eq!(pull.imported, 0);
    assert_eq!(
        fx.host.read(entity.id()).unwrap().header.title,
        "Fresh local title"
    );
    // Observed remote revision is recorded so the next pull skips it.
    let recorded = fx.ledger.get("calendar", "evt_778").unwrap().unwrap();
    assert_eq!(recorded.version_seen.as_deref(), Some("9"));
    fx.calendar.stage(change("evt_778", "9", "E9"));
    let again = fx.reconciler.pull().await.unwrap();
    assert_eq!(again.echoes, 2);
}

#[tokio::test]
async fn remote_deletion_archives_locally() {
    let fx = Fixture::new();
    let entity = fx.mirrored_event("evt_778");
    fx.reconciler.push().await.unwrap();

    let mut remote = change("evt_778", "9", "E9");
    remote.deleted = true;
    remote.last_modified = kira_core::now_utc() + Duration::minutes(1);
    fx.calendar.stage(remote);

    let pull = fx.reconciler.pull().await.unwrap();
    assert_eq!(pull.archived, 1);
    let local = fx.host.read(entity.id()).unwrap();
    assert_eq!(local.header.state, EntityState::Archived);
    assert!(fx.ledger.get("calendar", "evt_778").unwrap().is_none());
}

#[tokio::test]
async fn startup_reconcile_drops_rows_without_entities() {
    let fx = Fixture::new();
    let entity = fx.mirrored_event("evt_778");
    fx.reconciler.push().await.unwrap();
    assert_eq!(fx.ledger.len().unwrap(), 1);

    fx.host.delete(entity.id(), &WriteOptions::default()).unwrap();
    let dropped = fx.reconciler.reconcile_startup().unwrap();
    assert_eq!(dropped, 1);
    assert!(fx.ledger.is_empty().unwrap());
}
