//! In-process storage and coordination services for the online DDL engine.
//!
//! Two services live here:
//! - `kv`: a multi-version transactional key/value store with snapshot reads,
//!   optimistic write-write conflict detection and ordered range scans,
//! - `meta`: an etcd-style coordination store with revisions, compare-and-swap
//!   transactions and change notification.
//!
//! Both expose fault injection so callers can exercise their retry paths.

pub mod kv;
pub mod meta;

pub use kv::{prefix_end, KvEngine, KvError, MemEngine, Mutation, Timestamp, Txn, TxnStore};
pub use meta::{Compare, MetaEntry, MetaError, MetaOp, MetaStore, TxnResponse};
