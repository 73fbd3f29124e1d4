//! Single-writer storage layer for the Kira vault: frontmatter codec,
//! schema/FSM validation, crash-safe atomic writes with per-entity
//! locks, link graph, quarantine, audit, and the Host that composes
//! them.

pub mod alias;
pub mod audit;
pub mod frontmatter;
pub mod fsm;
pub mod graph;
pub mod host;
pub mod lock;
pub mod quarantine;
pub mod validate;
pub mod writer;

pub use alias::AliasTable;
pub use audit::{AuditRecord, AuditTrail};
pub use frontmatter::{parse_document, parse_header, render_document, serialize_header};
pub use fsm::apply_transition;
pub use graph::{BrokenLink, EdgeKind, GraphDiagnosis, LinkGraph, NearDuplicate, RawEdge, extract_edges};
pub use host::{HeaderPatch, Host, NullEmitter, PostWriteEmitter, WriteOptions};
pub use lock::{EntityLock, LockManager};
pub use quarantine::{Quarantine, QuarantineRecord};
pub use validate::validate;
pub use writer::{append_line, atomic_write, durable_remove};
