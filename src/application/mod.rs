//! Application layer
//!
//! The recovery engine: phase orchestration, the parallel chunk scan,
//! deduplication and progress reporting.

mod recovery_engine;

pub use recovery_engine::{EngineHandle, ProgressCallback, RecoveryEngine};
