//! Event plumbing for Kira: the in-process bus with at-least-once
//! delivery, the durable idempotency store that gates ingress, the
//! payload normalizer, and the dead-letter sink.

pub mod bus;
pub mod dead_letter;
pub mod idempotency;
pub mod normalize;

pub use bus::{BusOptions, EventBus, EventHandler};
pub use dead_letter::{DeadLetterRecord, DeadLetterSink, FileDeadLetter, NullDeadLetter};
pub use idempotency::IdempotencyStore;
pub use normalize::{IngressNormalizer, RawInbound, canonical_json, fingerprint};
