//! parquedb-lakehouse : the coordinators turning file-arrival notifications
//! into compaction and refresh workflow dispatches.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Windowed aggregation of writer outputs per namespace
pub mod compaction;
/// Debounced refresh tracking per materialized view
pub mod mv_refresh;
/// Arrival notification parsing and filtering
pub mod notifications;
/// Canonical file layouts per target format
pub mod paths;
/// Schema migration for the coordinator database
pub mod sql_coordinator_schema;
