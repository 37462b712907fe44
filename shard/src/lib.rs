//! parquedb-shard : the write/replay/flush/bulk engine of a single shard.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// The public operation surface of the shard
pub mod engine;
/// Per-namespace in-memory event buffers
pub mod event_buffer;
/// Typed per-namespace handles
pub mod namespace;
/// Bulk-bypass pending row groups on the object store
pub mod pending;
/// Event-sourced reconstruction of entity projections
pub mod projection;
/// The relationship graph
pub mod relationships;
/// Namespace sequence counters
pub mod sequence;
/// Connection to the shard's embedded SQL and blob storage
pub mod shard_connection;
/// Schema migration
pub mod sql_migration;
/// Table creation
pub mod sql_shard_schema;
/// Flushed WAL batches
pub mod wal;
