//! Interval, one-shot, and cron-style triggers for periodic work.
//!
//! Jobs are identified by a stable key (scheduling the same key again
//! replaces the job), fire as envelopes on the event bus so handlers
//! inherit retry and dead-lettering, and carry a per-job misfire policy
//! for runs missed while the process was busy or down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{Notify, watch};

use kira_core::{Envelope, format_utc, now_utc};
use kira_events::EventBus;

/// Backstop for how many missed cron occurrences `run_all` will replay.
const MAX_REPLAYED_OCCURRENCES: usize = 1000;

#[derive(Debug, Clone)]
pub enum Trigger {
    /// Every `Duration`, anchored at scheduling time.
    Interval(Duration),
    /// Once, at an instant.
    At(DateTime<Utc>),
    /// Cron expression evaluated in a civil zone ("every day at 08:00
    /// in Europe/Brussels" survives DST shifts).
    Cron { schedule: cron::Schedule, zone: Tz },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfirePolicy {
    /// Run once regardless of how many fires were missed.
    Coalesce,
    /// Drop missed fires entirely.
    Skip,
    /// Execute every missed occurrence.
    RunAll,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub key: String,
    pub trigger: Trigger,
    pub misfire: MisfirePolicy,
    /// Event type published on each fire (e.g. `rollup.requested`).
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug)]
struct Job {
    spec: JobSpec,
    next_due: DateTime<Utc>,
}

pub struct Scheduler {
    bus: EventBus,
    jobs: Mutex<HashMap<String, Job>>,
    changed: Notify,
}

impl Scheduler {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            jobs: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        })
    }

    /// Register or replace a job.
    pub fn schedule(&self, spec: JobSpec) {
        let now = now_utc();
        let next_due = match &spec.trigger {
            Trigger::Interval(every) => now + chrono_duration(*every),
            Trigger::At(at) => *at,
            Trigger::Cron { schedule, zone } => match cron_next(schedule, *zone, now) {
                Some(next) => next,
                None => {
                    tracing::warn!(key = %spec.key, "cron schedule yields no future fire; job dropped");
                    return;
                }
            },
        };
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(spec.key.clone(), Job { spec, next_due });
        }
        self.changed.notify_waiters();
    }

    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .map(|mut jobs| jobs.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.changed.notify_waiters();
        }
        removed
    }

    pub fn job_keys(&self) -> Vec<String> {
        self.jobs
            .lock()
            .map(|jobs| {
                let mut keys: Vec<String> = jobs.keys().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }

    /// Drive the trigger loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wake_at = self
                .jobs
                .lock()
                .ok()
                .and_then(|jobs| jobs.values().map(|j| j.next_due).min());
            let pause = match wake_at {
                Some(at) => (at - now_utc())
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(pause) => self.tick(),
            }
        }
    }

    fn tick(&self) {
        let now = now_utc();
        let Ok(mut jobs) = self.jobs.lock() else {
            return;
        };
        let mut finished: Vec<String> = Vec::new();

        for (key, job) in jobs.iter_mut() {
            if job.next_due > now {
                continue;
            }
            let due = occurrences_between(&job.spec.trigger, job.next_due, now);
            let fires = apply_misfire(job.spec.misfire, &due);
            if fires.len() < due.len() {
                tracing::warn!(
                    key = %key,
                    missed = due.len() - fires.len(),
                    policy = ?job.spec.misfire,
                    "missed scheduler runs dropped"
                );
            }
            for occurrence in fires {
                self.fire(&job.spec, occurrence);
            }
            match next_after(&job.spec.trigger, now) {
                Some(next) => job.next_due = next,
                None => finished.push(key.clone()),
            }
        }
        for key in finished {
            jobs.remove(&key);
        }
    }

    fn fire(&self, spec: &JobSpec, occurrence: DateTime<Utc>) {
        let mut payload = spec.payload.clone();
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("job".to_string(), spec.key.clone().into());
            map.insert("scheduled_for".to_string(), format_utc(occurrence).into());
        }
        let envelope = Envelope::new("scheduler", spec.event_type.clone(), payload);
        if let Err(err) = self.bus.publish(envelope) {
            tracing::warn!(key = %spec.key, error = %err, "scheduler fire dropped");
        }
    }
}

/// All occurrence instants of `trigger` in `[from, now]`.
fn occurrences_between(
    trigger: &Trigger,
    from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    match trigger {
        Trigger::Interval(every) => {
            let step = chrono_duration(*every);
            if step.is_zero() {
                return vec![now];
            }
            let mut occurrences = Vec::new();
            let mut at = from;
            while at <= now && occurrences.len() < MAX_REPLAYED_OCCURRENCES {
                occurrences.push(at);
                at += step;
            }
            occurrences
        }
        Trigger::At(at) => {
            if *at <= now {
                vec![*at]
            } else {
                Vec::new()
            }
        }
        Trigger::Cron { schedule, zone } => {
            // `after` is exclusive; nudge back so `from` itself counts.
            let start = (from - chrono::Duration::seconds(1)).with_timezone(zone);
            schedule
                .after(&start)
                .map(|dt| dt.with_timezone(&Utc))
                .take_while(|dt| *dt <= now)
                .take(MAX_REPLAYED_OCCURRENCES)
                .collect()
        }
    }
}

fn next_after(trigger: &Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Interval(every) => Some(now + chrono_duration(*every)),
        Trigger::At(_) => None,
        Trigger::Cron { schedule, zone } => cron_next(schedule, *zone, now),
    }
}

fn cron_next(schedule: &cron::Schedule, zone: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&zone))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

fn apply_misfire(policy: MisfirePolicy, due: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    if due.len() <= 1 {
        return due.to_vec();
    }
    match policy {
        MisfirePolicy::Coalesce => due.last().map(|last| vec![*last]).unwrap_or_default(),
        MisfirePolicy::Skip => Vec::new(),
        MisfirePolicy::RunAll => due.to_vec(),
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kira_core::error::Result;
    use kira_events::{BusOptions, EventHandler, NullDeadLetter};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counter {
        fired: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_bus() -> EventBus {
        EventBus::new(
            BusOptions {
                grace: Duration::from_millis(5),
                ..BusOptions::default()
            },
            Arc::new(NullDeadLetter),
        )
    }

    #[test]
    fn misfire_policies_shape_the_fire_list() {
        let base = now_utc();
        let due: Vec<_> = (0..4).map(|i| base + chrono::Duration::seconds(i)).collect();
        assert_eq!(apply_misfire(MisfirePolicy::Coalesce, &due), vec![due[3]]);
        assert!(apply_misfire(MisfirePolicy::Skip, &due).is_empty());
        assert_eq!(apply_misfire(MisfirePolicy::RunAll, &due).len(), 4);
        // A single on-time fire is unaffected by policy.
        assert_eq!(apply_misfire(MisfirePolicy::Skip, &due[..1]).len(), 1);
    }

    #[test]
    fn interval_occurrences_cover_the_gap() {
        let from = now_utc();
        let trigger = Trigger::Interval(Duration::from_secs(60));
        let occurrences =
            occurrences_between(&trigger, from, from + chrono::Duration::seconds(150));
        assert_eq!(occurrences.len(), 3);
        assert_eq!(occurrences[0], from);
    }

    #[test]
    fn cron_occurrences_resolve_in_zone() {
        // 08:00 every day, Brussels time.
        let schedule = cron::Schedule::from_str("0 0 8 * * *").unwrap();
        let zone: Tz = "Europe/Brussels".parse().unwrap();
        let trigger = Trigger::Cron { schedule, zone };
        let from = kira_core::parse_utc("2025-07-14T06:00:00+00:00").unwrap(); // 08:00 CEST
        let occurrences =
            occurrences_between(&trigger, from, from + chrono::Duration::days(2));
        assert_eq!(occurrences.len(), 3);
        assert_eq!(occurrences[0], from);
        assert_eq!(occurrences[1], from + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn interval_job_fires_repeatedly() {
        let bus = fast_bus();
        let handler = Arc::new(Counter::default());
        bus.subscribe("maintenance.purge_requested", handler.clone());

        let scheduler = Scheduler::new(bus.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        scheduler.schedule(JobSpec {
            key: "ttl-purge".to_string(),
            trigger: Trigger::Interval(Duration::from_millis(25)),
            misfire: MisfirePolicy::Coalesce,
            event_type: "maintenance.purge_requested".to_string(),
            payload: serde_json::json!({}),
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        bus.drain().await;

        assert!(handler.fired.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn one_shot_fires_once_and_same_key_replaces() {
        let bus = fast_bus();
        let handler = Arc::new(Counter::default());
        bus.subscribe("rollup.requested", handler.clone());

        let scheduler = Scheduler::new(bus.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        // Two schedules under one key: only the replacement survives.
        scheduler.schedule(JobSpec {
            key: "rollup".to_string(),
            trigger: Trigger::At(now_utc() + chrono::Duration::days(1)),
            misfire: MisfirePolicy::Coalesce,
            event_type: "rollup.requested".to_string(),
            payload: serde_json::json!({"scope": "daily"}),
        });
        scheduler.schedule(JobSpec {
            key: "rollup".to_string(),
            trigger: Trigger::At(now_utc()),
            misfire: MisfirePolicy::Coalesce,
            event_type: "rollup.requested".to_string(),
            payload: serde_json::json!({"scope": "daily"}),
        });
        assert_eq!(scheduler.job_keys(), vec!["rollup".to_string()]);

        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        bus.drain().await;

        assert_eq!(handler.fired.load(Ordering::SeqCst), 1);
        // One-shot jobs are removed after firing.
        assert!(scheduler.job_keys().is_empty());
    }
}
