//! parquedb-streaming : fans accepted events out to registered materialized
//! view handlers, batching per view.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

pub mod mv_engine;

pub use mv_engine::{
    MvEngineStats, MvProcessor, MvRegistration, StreamingMvConfig, StreamingMvEngine,
};
