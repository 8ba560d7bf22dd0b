//! Stitch — a database-backed workflow execution engine.
//!
//! Runs directed acyclic graphs of typed nodes (Worker, UX, Splitter,
//! Collector, SectionItem) against external services. Process-wide
//! stateless: every advance step reads and writes the run record through
//! the [`store::RunStore`] trait, so restarts lose no progress and any
//! replica can serve any event.

pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod path;
pub mod registry;
pub mod store;
pub mod store_memory;
pub mod types;

mod handlers;
mod walker;

#[cfg(test)]
mod test_fixtures;

pub use engine::{StartedRun, StitchEngine};
pub use error::{EngineError, ValidationError};
