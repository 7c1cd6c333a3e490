//! Per-run state: contexts and the tracker that owns them.

pub mod context;
pub mod tracker;

pub use context::{
    DarkReference, RunConfigView, RunContext, RunDefaults, RunPhase, RunSummary,
    DEFAULT_IMAGE_KEY,
};
pub use tracker::{EventRoute, RunTracker, DEFAULT_CLOSED_RUN_MEMORY};
