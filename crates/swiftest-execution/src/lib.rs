//! In-process test execution engine for the Swiftest test runner.
//!
//! Consumes the plan produced by `swiftest-core`, drives the embedded
//! interpreter, and emits the structured event stream. Single-threaded with
//! respect to user code; cooperative concurrency happens only inside async
//! batches on one asyncio loop.

pub mod batch;
pub mod capture;
pub mod event_loop;
pub mod executor;
pub mod fixtures;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use pyo3::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use swiftest_core::diagnostic::Diagnostic;
use swiftest_core::events::{Event, EventSink, Outcome, Summary};
use swiftest_core::test::discovery::TestItem;
use swiftest_core::{Config, LastFailedCache, Scheduler};

pub use executor::Executor;
pub use fixtures::FixtureRuntime;

/// Result of running one test item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub outcome: Outcome,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub diagnostic: Option<Diagnostic>,
}

impl TestResult {
    /// A result that never reached invocation: no duration, no output.
    pub fn bare(item: &TestItem, outcome: Outcome, diagnostic: Option<Diagnostic>) -> Self {
        Self {
            id: item.id.clone(),
            outcome,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            diagnostic,
        }
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<TestResult>,
    pub summary: Summary,
}

impl RunReport {
    fn new(results: Vec<TestResult>, duration: Duration) -> Self {
        let mut summary = Summary {
            duration,
            ..Summary::default()
        };
        for result in &results {
            summary.record(result.outcome);
        }
        Self { results, summary }
    }

    pub fn exit_code(&self) -> u8 {
        self.summary.exit_code()
    }

    fn outcomes(&self) -> impl Iterator<Item = (&str, Outcome)> {
        self.results
            .iter()
            .map(|result| (result.id.as_str(), result.outcome))
    }
}

/// Run the full pipeline: discovery, planning, execution, cache rewrite.
/// Events flow to `sink` in plan order; `RunEnded` fires after the cache is
/// rewritten.
pub fn run(
    config: &Config,
    paths: &[PathBuf],
    sink: &dyn EventSink,
) -> swiftest_core::Result<RunReport> {
    config.validate()?;
    let started = Instant::now();

    Python::with_gil(|py| {
        let suite = swiftest_core::discover(py, paths, config)?;
        let cache_dir = config.cache_dir_for(&suite.root);
        let mut cache = LastFailedCache::load(&cache_dir);

        let plan = Scheduler::new(config, &suite.registry, &cache).build(suite.items);
        let results = Executor::new(config, sink).run(py, &plan)?;
        let report = RunReport::new(results, started.elapsed());

        // The cache write never blocks the final summary.
        cache.record_run(report.outcomes());
        if let Err(err) = cache.save(&cache_dir) {
            warn!("failed to write last-failed cache: {err}");
        }

        sink.emit(Event::RunEnded {
            summary: report.summary.clone(),
        });
        Ok(report)
    })
}
