//! parquedb-types : the data model shared by the shard engine, the streaming
//! engine and the coordinators.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Narrow wrapper over the object store
pub mod blob_storage;
/// LZ4 compression of WAL batch payloads
pub mod compression;
/// Entity projections and their identifiers
pub mod entity;
/// The error taxonomy surfaced to callers
pub mod error;
/// Events and their wire format
pub mod event;
/// Update operators
pub mod mutation;
/// Base-62 encoding of sequence counters
pub mod short_id;
/// Seam between the shard engine and in-process event consumers
pub mod sink;
