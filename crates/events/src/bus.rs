//! In-process pub/sub with envelope standardization and at-least-once
//! delivery.
//!
//! One worker task per source keeps (source, key) FIFO order; a grace
//! buffer holds arrivals briefly and releases them in timestamp order
//! to absorb mild out-of-order delivery.  Handler failures retry with
//! exponential backoff and ±20% jitter without blocking other sources;
//! exhausted events go to the dead-letter sink.  `drain` stops intake
//! and waits for in-flight work up to a deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep_until, timeout};

use kira_core::Envelope;
use kira_core::error::{KiraError, Result};

use crate::dead_letter::DeadLetterSink;

/// Tuning knobs; see `[bus]` in `kira.toml`.
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub grace: Duration,
    pub max_attempts: u32,
    pub retry_initial: Duration,
    pub handler_budget: Duration,
    pub drain_deadline: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            max_attempts: 5,
            retry_initial: Duration::from_secs(1),
            handler_budget: Duration::from_secs(60),
            drain_deadline: Duration::from_secs(30),
        }
    }
}

impl From<&kira_config::BusConfig> for BusOptions {
    fn from(config: &kira_config::BusConfig) -> Self {
        Self {
            grace: Duration::from_secs(config.grace_secs),
            max_attempts: config.max_attempts,
            retry_initial: Duration::from_millis(config.retry_initial_ms),
            handler_budget: Duration::from_secs(config.handler_budget_secs),
            drain_deadline: Duration::from_secs(config.drain_deadline_secs),
        }
    }
}

/// A unit of work subscribed to one or more event types.  Handlers may
/// block on IO; idempotency under redelivery is their contract.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

#[derive(Clone)]
struct Subscription {
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

struct Queued {
    envelope: Envelope,
    due: Instant,
}

/// Buffer key: (event_ts µs, seq, arrival counter) so release order is
/// timestamp order with `seq` and arrival as tie-breakers.
type BufKey = (i64, u64, u64);

struct BusInner {
    options: BusOptions,
    subscriptions: RwLock<Vec<Subscription>>,
    sources: Mutex<HashMap<String, mpsc::UnboundedSender<Queued>>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(options: BusOptions, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                options,
                subscriptions: RwLock::new(Vec::new()),
                sources: Mutex::new(HashMap::new()),
                dead_letters,
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a handler for `pattern`: an exact type, a `prefix.*`
    /// family, or `*` for everything.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let subscription = Subscription {
            pattern: pattern.into(),
            handler,
        };
        if let Ok(mut subscriptions) = self.inner.subscriptions.write() {
            subscriptions.push(subscription);
        }
    }

    /// Enqueue an envelope.  Must be called from within a tokio runtime;
    /// fails once `drain` has begun.
    pub fn publish(&self, envelope: Envelope) -> Result<()> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(KiraError::Storage("event bus is draining".to_string()));
        }
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let queued = Queued {
            due: Instant::now() + inner.options.grace,
            envelope,
        };

        let mut sources = inner
            .sources
            .lock()
            .map_err(|_| KiraError::Storage("bus source table poisoned".to_string()))?;
        let sender = sources
            .entry(queued.envelope.source.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_source_worker(Arc::clone(inner), rx));
                tx
            });
        if sender.send(queued).is_err() {
            finish_one(inner);
            return Err(KiraError::Storage("bus source worker terminated".to_string()));
        }
        Ok(())
    }

    /// Events accepted but not yet fully handled.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting events, flush buffered ones, and wait for
    /// in-flight handlers.  Returns false if the deadline elapsed first.
    pub async fn drain(&self) -> bool {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        if let Ok(mut sources) = inner.sources.lock() {
            // Dropping the senders closes the queues; workers flush
            // their buffers without waiting out the grace period.
            sources.clear();
        }

        let waited = timeout(inner.options.drain_deadline, async {
            loop {
                if inner.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                let notified = inner.idle.notified();
                if inner.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::warn!(
                in_flight = inner.in_flight.load(Ordering::SeqCst),
                "bus drain deadline elapsed with handlers still running"
            );
        }
        waited.is_ok()
    }
}

async fn run_source_worker(inner: Arc<BusInner>, mut rx: mpsc::UnboundedReceiver<Queued>) {
    let mut buffer: BTreeMap<BufKey, Queued> = BTreeMap::new();
    let mut arrivals: u64 = 0;

    let mut insert = |buffer: &mut BTreeMap<BufKey, Queued>, queued: Queued, arrivals: &mut u64| {
        let key = (
            queued.envelope.event_ts.timestamp_micros(),
            queued.envelope.seq.unwrap_or(u64::MAX),
            *arrivals,
        );
        *arrivals += 1;
        buffer.insert(key, queued);
    };

    loop {
        if buffer.is_empty() {
            match rx.recv().await {
                Some(queued) => insert(&mut buffer, queued, &mut arrivals),
                None => break,
            }
            continue;
        }

        // The buffer releases in key (timestamp) order as soon as its
        // eldest arrival has aged the full grace period.
        let eldest_due = buffer
            .values()
            .map(|q| q.due)
            .min()
            .unwrap_or_else(Instant::now);

        tokio::select! {
            received = rx.recv() => match received {
                Some(queued) => insert(&mut buffer, queued, &mut arrivals),
                None => {
                    // Draining: flush what is buffered, in order, now.
                    for (_, queued) in std::mem::take(&mut buffer) {
                        deliver(&inner, &queued.envelope).await;
                        finish_one(&inner);
                    }
                    break;
                }
            },
            _ = sleep_until(eldest_due) => {
                if let Some((&key, _)) = buffer.iter().next() {
                    if let Some(queued) = buffer.remove(&key) {
                        deliver(&inner, &queued.envelope).await;
                        finish_one(&inner);
                    }
                }
            }
        }
    }
}

async fn deliver(inner: &Arc<BusInner>, envelope: &Envelope) {
    let matching: Vec<Subscription> = match inner.subscriptions.read() {
        Ok(subscriptions) => subscriptions
            .iter()
            .filter(|s| pattern_matches(&s.pattern, &envelope.event_type))
            .cloned()
            .collect(),
        Err(_) => Vec::new(),
    };
    for subscription in matching {
        deliver_with_retry(inner, envelope, &subscription).await;
    }
}

async fn deliver_with_retry(inner: &Arc<BusInner>, envelope: &Envelope, subscription: &Subscription) {
    let options = &inner.options;
    let mut attempt: u32 = 1;
    loop {
        let outcome = timeout(options.handler_budget, subscription.handler.handle(envelope)).await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("handler budget of {:?} exceeded", options.handler_budget),
        };

        if attempt >= options.max_attempts {
            tracing::error!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                handler = subscription.handler.name(),
                attempts = attempt,
                error = %error,
                "delivery exhausted; dead-lettering"
            );
            inner
                .dead_letters
                .record(envelope, subscription.handler.name(), &error, attempt);
            return;
        }

        let backoff = backoff_delay(options.retry_initial, attempt);
        tracing::warn!(
            event_id = %envelope.event_id,
            handler = subscription.handler.name(),
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "handler failed; retrying"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

fn finish_one(inner: &BusInner) {
    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.idle.notify_waiters();
    }
}

/// Doubling backoff with ±20% jitter.
fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let base = initial.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base * jitter).round() as u64)
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    pattern
        .strip_suffix(".*")
        .is_some_and(|prefix| {
            event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterSink;
    use std::sync::atomic::AtomicU32;

    fn test_options() -> BusOptions {
        BusOptions {
            grace: Duration::from_millis(30),
            max_attempts: 3,
            retry_initial: Duration::from_millis(5),
            handler_budget: Duration::from_millis(500),
            drain_deadline: Duration::from_secs(2),
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_first: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, envelope: &Envelope) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(KiraError::Storage("induced failure".to_string()));
            }
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(envelope.event_id.clone());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        records: Mutex<Vec<(String, u32)>>,
    }

    impl DeadLetterSink for CapturingSink {
        fn record(&self, envelope: &Envelope, _handler: &str, _error: &str, attempts: u32) {
            if let Ok(mut records) = self.records.lock() {
                records.push((envelope.event_id.clone(), attempts));
            }
        }
    }

    #[tokio::test]
    async fn delivers_to_exact_and_wildcard_subscribers() {
        let bus = EventBus::new(test_options(), Arc::new(crate::dead_letter::NullDeadLetter));
        let exact = Arc::new(Recorder::default());
        let family = Arc::new(Recorder::default());
        let unrelated = Arc::new(Recorder::default());
        bus.subscribe("entity.created", exact.clone());
        bus.subscribe("entity.*", family.clone());
        bus.subscribe("sync.remote_changed", unrelated.clone());

        bus.publish(Envelope::new("host", "entity.created", serde_json::json!({})))
            .unwrap();
        bus.drain().await;

        assert_eq!(exact.seen.lock().unwrap().len(), 1);
        assert_eq!(family.seen.lock().unwrap().len(), 1);
        assert!(unrelated.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let bus = EventBus::new(test_options(), Arc::new(crate::dead_letter::NullDeadLetter));
        let handler = Arc::new(Recorder {
            fail_first: AtomicU32::new(2),
            ..Recorder::default()
        });
        bus.subscribe("message.received", handler.clone());

        bus.publish(Envelope::new("chat", "message.received", serde_json::json!({})))
            .unwrap();
        bus.drain().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_letters_after_exhaustion() {
        let sink = Arc::new(CapturingSink::default());
        let bus = EventBus::new(test_options(), sink.clone());
        let handler = Arc::new(Recorder {
            fail_first: AtomicU32::new(u32::MAX),
            ..Recorder::default()
        });
        bus.subscribe("message.received", handler.clone());

        let envelope = Envelope::new("chat", "message.received", serde_json::json!({}));
        let event_id = envelope.event_id.clone();
        bus.publish(envelope).unwrap();
        bus.drain().await;

        let records = sink.records.lock().unwrap();
        assert_eq!(records.as_slice(), &[(event_id, 3)]);
    }

    #[tokio::test]
    async fn grace_buffer_releases_in_timestamp_order() {
        let bus = EventBus::new(test_options(), Arc::new(crate::dead_letter::NullDeadLetter));
        let handler = Arc::new(Recorder::default());
        bus.subscribe("message.received", handler.clone());

        let now = kira_core::now_utc();
        let late = Envelope::new("chat", "message.received", serde_json::json!({"n": 2}))
            .with_ts(now + chrono::Duration::seconds(2));
        let early = Envelope::new("chat", "message.received", serde_json::json!({"n": 1}))
            .with_ts(now + chrono::Duration::seconds(1));
        let late_id = late.event_id.clone();
        let early_id = early.event_id.clone();

        // Published out of order; the grace buffer re-sequences them.
        bus.publish(late).unwrap();
        bus.publish(early).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        bus.drain().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[early_id, late_id]);
    }

    #[tokio::test]
    async fn drain_rejects_new_events() {
        let bus = EventBus::new(test_options(), Arc::new(crate::dead_letter::NullDeadLetter));
        let handler = Arc::new(Recorder::default());
        bus.subscribe("*", handler.clone());

        bus.publish(Envelope::new("chat", "message.received", serde_json::json!({})))
            .unwrap();
        assert!(bus.drain().await);
        assert_eq!(bus.in_flight(), 0);
        assert!(bus
            .publish(Envelope::new("chat", "message.received", serde_json::json!({})))
            .is_err());
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }
}
