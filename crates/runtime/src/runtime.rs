//! Composition root: opens the stores, recovers state, registers the
//! built-in handlers, and drives the scheduler and inbox watcher until
//! shutdown.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tokio::sync::watch;

use kira_config::AppConfig;
use kira_core::envelope::types;
use kira_core::{Envelope, parse_zone};
use kira_events::{BusOptions, EventBus, FileDeadLetter, IdempotencyStore, IngressNormalizer};
use kira_rollup::RollupEngine;
use kira_scheduler::{JobSpec, MisfirePolicy, Scheduler, Trigger};
use kira_sync::{CalendarProvider, Reconciler, ReconcilerOptions, SyncLedger};
use kira_vault::{AuditTrail, Host, PostWriteEmitter};

use crate::handlers::{
    EntityRequestHandler, MaintenanceHandler, MessageHandler, RollupHandler, SyncCycleHandler,
    SyncPushHandler,
};
use crate::inbox::{InboxWatcher, spawn_inbox_watcher};

/// Routes the Host's post-write events onto the bus.  Outside a tokio
/// context (one-shot CLI commands) events are dropped; the vault write
/// itself has already succeeded.
struct BusEmitter {
    bus: EventBus,
}

impl PostWriteEmitter for BusEmitter {
    fn emit(&self, envelope: Envelope) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!(event_type = %envelope.event_type, "post-write event outside runtime dropped");
            return;
        }
        if let Err(err) = self.bus.publish(envelope) {
            tracing::warn!(error = %err, "post-write event not published");
        }
    }
}

pub struct Runtime {
    config: AppConfig,
    zone: Tz,
    host: Arc<Host>,
    bus: EventBus,
    normalizer: Arc<IngressNormalizer>,
    rollups: Arc<RollupEngine>,
    scheduler: Arc<Scheduler>,
    reconciler: Option<Arc<Reconciler>>,
    shutdown_tx: watch::Sender<bool>,
    scheduler_task: tokio::task::JoinHandle<()>,
    inbox: Option<InboxWatcher>,
}

impl Runtime {
    /// Wire the whole engine and perform startup recovery.
    ///
    /// `provider` is the external calendar collaborator; `None` runs
    /// with sync disabled regardless of configuration.
    pub async fn start(
        config: AppConfig,
        provider: Option<Arc<dyn CalendarProvider>>,
    ) -> Result<Self> {
        let vault_root = std::path::PathBuf::from(&config.vault.root);
        let zone = parse_zone(&config.time.timezone)
            .with_context(|| format!("invalid [time] timezone '{}'", config.time.timezone))?;

        let bus = EventBus::new(
            BusOptions::from(&config.bus),
            Arc::new(FileDeadLetter::new(&vault_root)),
        );
        let host = Arc::new(Host::open(
            &vault_root,
            &config.host,
            Box::new(BusEmitter { bus: bus.clone() }),
        )?);
        let audit = AuditTrail::new(&vault_root);

        // Startup recovery: the on-disk vault is the source of truth;
        // the graph journal was already replayed by Host::open, and a
        // full scan reconciles it with the actual files.
        let scanned = host.rebuild_graph()?;
        tracing::info!(entities = scanned, "link graph rebuilt from vault scan");

        let idempotency = Arc::new(Mutex::new(IdempotencyStore::open(
            vault_root.join(".state").join("idempotency.db"),
        )?));
        let normalizer = Arc::new(IngressNormalizer::new(
            bus.clone(),
            idempotency.clone(),
            audit.clone(),
        ));
        let rollups = Arc::new(RollupEngine::new(host.clone()));
        let scheduler = Scheduler::new(bus.clone());

        let reconciler = match provider {
            Some(provider) if config.sync.enabled => {
                let ledger = Arc::new(SyncLedger::open(
                    vault_root.join(".state").join("sync_ledger.db"),
                )?);
                let reconciler = Arc::new(Reconciler::new(
                    host.clone(),
                    ledger,
                    provider,
                    audit.clone(),
                    ReconcilerOptions::from(&config.sync),
                ));
                let dropped = reconciler.reconcile_startup()?;
                if dropped > 0 {
                    tracing::info!(dropped, "stale sync ledger rows reconciled");
                }
                Some(reconciler)
            }
            _ => None,
        };

        bus.subscribe(
            types::MESSAGE_RECEIVED,
            Arc::new(MessageHandler::new(host.clone())),
        );
        let requests = Arc::new(EntityRequestHandler::new(host.clone()));
        bus.subscribe(types::ENTITY_UPSERT_REQUESTED, requests.clone());
        bus.subscribe(types::ENTITY_UPDATE_REQUESTED, requests);
        bus.subscribe(
            types::ROLLUP_REQUESTED,
            Arc::new(RollupHandler::new(rollups.clone(), vault_root.clone(), zone)),
        );
        bus.subscribe(
            types::MAINTENANCE_PURGE_REQUESTED,
            Arc::new(MaintenanceHandler::new(
                idempotency.clone(),
                host.clone(),
                config.idempotency.ttl_days,
            )),
        );
        if let Some(reconciler) = &reconciler {
            bus.subscribe(
                types::SYNC_REMOTE_CHANGED,
                Arc::new(SyncCycleHandler::new(reconciler.clone())),
            );
            let push = Arc::new(SyncPushHandler::new(reconciler.clone()));
            bus.subscribe("entity.*", push.clone());
            bus.subscribe(types::TASK_TRANSITIONED, push);
        }

        if reconciler.is_some() {
            scheduler.schedule(JobSpec {
                key: "sync-pull".to_string(),
                trigger: Trigger::Interval(Duration::from_secs(config.sync.pull_interval_secs)),
                misfire: MisfirePolicy::Coalesce,
                event_type: types::SYNC_REMOTE_CHANGED.to_string(),
                payload: serde_json::json!({}),
            });
        }
        let daily_cron = format!("0 0 {} * * *", config.rollup.daily_hour);
        scheduler.schedule(JobSpec {
            key: "daily-rollup".to_string(),
            trigger: Trigger::Cron {
                schedule: cron::Schedule::from_str(&daily_cron)
                    .with_context(|| format!("invalid rollup cron '{daily_cron}'"))?,
                zone,
            },
            misfire: MisfirePolicy::Coalesce,
            event_type: types::ROLLUP_REQUESTED.to_string(),
            payload: serde_json::json!({"scope": "daily"}),
        });
        let weekly_cron = format!("0 0 {} * * Mon", config.rollup.daily_hour);
        scheduler.schedule(JobSpec {
            key: "weekly-rollup".to_string(),
            trigger: Trigger::Cron {
                schedule: cron::Schedule::from_str(&weekly_cron)
                    .with_context(|| format!("invalid rollup cron '{weekly_cron}'"))?,
                zone,
            },
            misfire: MisfirePolicy::Coalesce,
            event_type: types::ROLLUP_REQUESTED.to_string(),
            payload: serde_json::json!({"scope": "weekly"}),
        });
        scheduler.schedule(JobSpec {
            key: "idempotency-maintenance".to_string(),
            trigger: Trigger::Interval(Duration::from_secs(24 * 60 * 60)),
            misfire: MisfirePolicy::Coalesce,
            event_type: types::MAINTENANCE_PURGE_REQUESTED.to_string(),
            payload: serde_json::json!({}),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        let inbox = Some(spawn_inbox_watcher(&vault_root, normalizer.clone())?);

        audit.note("runtime.start", None, &kira_core::new_trace_id(), "ok");
        tracing::info!(vault = %vault_root.display(), sync = reconciler.is_some(), "runtime started");

        Ok(Self {
            config,
            zone,
            host,
            bus,
            normalizer,
            rollups,
            scheduler,
            reconciler,
            shutdown_tx,
            scheduler_task,
            inbox,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn host(&self) -> Arc<Host> {
        self.host.clone()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn normalizer(&self) -> Arc<IngressNormalizer> {
        self.normalizer.clone()
    }

    pub fn rollups(&self) -> Arc<RollupEngine> {
        self.rollups.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn reconciler(&self) -> Option<Arc<Reconciler>> {
        self.reconciler.clone()
    }

    /// Graceful shutdown: stop the scheduler and watcher, then drain the
    /// bus up to its configured deadline.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.scheduler_task).await;
        if let Some(inbox) = self.inbox.take() {
            inbox.stop().await;
        }
        let drained = self.bus.drain().await;
        if !drained {
            tracing::warn!("bus drain hit its deadline during shutdown");
        }
        tracing::info!("runtime stopped");
    }
}
