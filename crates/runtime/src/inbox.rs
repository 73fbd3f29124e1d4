//! Filesystem ingress: a `notify` watcher over `{vault_root}/inbox/`.
//!
//! Dropped `.md`/`.txt` files become `message.received` payloads; `.json`
//! files carry a structured request (`{"type": …, "payload": …}`).
//! Successfully ingested files move to `inbox/processed/`; files the
//! normalizer rejects stay put for inspection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;

use notify::{RecursiveMode, Watcher};

use kira_core::error::{KiraError, Result};
use kira_events::{IngressNormalizer, RawInbound};

pub struct InboxWatcher {
    // Held so the OS watch stays registered; dropping it ends the loop.
    _watcher: notify::RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl InboxWatcher {
    pub async fn stop(self) {
        drop(self._watcher);
        let _ = self.task.await;
    }
}

/// Start watching the inbox.  Pre-existing files are swept first so
/// drops made while the daemon was down are not lost.
pub fn spawn_inbox_watcher(
    vault_root: &Path,
    normalizer: Arc<IngressNormalizer>,
) -> Result<InboxWatcher> {
    let inbox = vault_root.join("inbox");
    fs::create_dir_all(inbox.join("processed"))?;

    let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .map_err(|err| KiraError::Storage(format!("inbox watcher: {err}")))?;
    watcher
        .watch(&inbox, RecursiveMode::NonRecursive)
        .map_err(|err| KiraError::Storage(format!("inbox watch on {}: {err}", inbox.display())))?;

    let task = tokio::task::spawn_blocking(move || {
        sweep_existing(&inbox, &normalizer);
        while let Ok(event) = rx.recv() {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "inbox watch error");
                    continue;
                }
            };
            if !matches!(
                event.kind,
                notify::EventKind::Create(_) | notify::EventKind::Modify(_)
            ) {
                continue;
            }
            for path in event.paths {
                process_drop(&inbox, &path, &normalizer);
            }
        }
        tracing::debug!("inbox watcher stopped");
    });

    Ok(InboxWatcher {
        _watcher: watcher,
        task,
    })
}

fn sweep_existing(inbox: &Path, normalizer: &IngressNormalizer) {
    let Ok(entries) = fs::read_dir(inbox) else {
        return;
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    for path in paths {
        process_drop(inbox, &path, normalizer);
    }
}

fn process_drop(inbox: &Path, path: &Path, normalizer: &IngressNormalizer) {
    if !path.is_file() || path.parent() != Some(inbox) {
        return;
    }
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return;
    };
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !matches!(extension.as_str(), "md" | "txt" | "json") {
        return;
    }
    let Ok(contents) = fs::read_to_string(path) else {
        tracing::warn!(path = %path.display(), "unreadable inbox drop skipped");
        return;
    };

    let raw = match extension.as_str() {
        "json" => match serde_json::from_str::<serde_json::Value>(&contents) {
            Ok(value) => {
                let event_type = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("entity.upsert_requested")
                    .to_string();
                let payload = value.get("payload").cloned().unwrap_or(value);
                RawInbound {
                    source: "inbox".to_string(),
                    external_id: name.clone(),
                    event_type,
                    payload,
                    event_ts: None,
                    seq: None,
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "malformed inbox JSON left in place");
                return;
            }
        },
        _ => RawInbound {
            source: "inbox".to_string(),
            external_id: name.clone(),
            event_type: "message.received".to_string(),
            payload: serde_json::json!({"text": contents}),
            event_ts: None,
            seq: None,
        },
    };

    match normalizer.ingest(raw) {
        Ok(published) => {
            let processed = inbox.join("processed").join(&name);
            if let Err(err) = fs::rename(path, &processed) {
                tracing::warn!(path = %path.display(), error = %err, "could not archive processed drop");
            }
            if published.is_none() {
                tracing::debug!(file = %name, "duplicate inbox drop");
            }
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "inbox drop not ingested");
        }
    }
}
