//! Core types and test discovery for the Swiftest test runner.
//!
//! This crate provides the interpreter-facing building blocks:
//! - Discovery: walking the tree, loading test files, harvesting callables
//! - The fixture registry and dependency resolver
//! - Plan construction, including async batch formation
//! - The last-failed cache and the structured event stream

// Core modules
pub mod cache;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod events;
pub mod interp;
pub mod plan;

// Test-related functionality
pub mod test {
    pub mod discovery;
    pub mod fixtures;
    pub mod markers;
    pub mod parametrize;
    pub mod resolver;
}

// Re-export core types
pub use cache::LastFailedCache;
pub use config::Config;
pub use diagnostic::{ContextLine, Diagnostic, DiagnosticFrame};
pub use error::{Error, Result};
pub use events::{BufferSink, ChannelSink, Event, EventSink, Outcome, Summary};
pub use plan::{AsyncBatch, PlanStep, PlannedTest, Scheduler, TestPlan};
pub use test::discovery::{discover, project_root, DiscoveredSuite, TestItem};
pub use test::fixtures::{FixtureDef, FixtureRegistry, FixtureScope};
pub use test::markers::{LoopScope, Marker, XfailSpec};
pub use test::resolver::{resolve, ResolveError};

// Version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
