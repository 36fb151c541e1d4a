//! Plan execution.
//!
//! Consumes the ordered plan step by step, emitting events strictly in plan
//! order. Sync items and lone async items run sequentially; async batches
//! are gathered on a shared loop. Scope-expired fixtures are finalized when
//! the next step crosses a scope-instance boundary, narrower scopes first.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::debug;

use swiftest_core::diagnostic::Diagnostic;
use swiftest_core::events::{Event, EventSink, Outcome};
use swiftest_core::interp;
use swiftest_core::plan::{AsyncBatch, PlanStep, PlannedTest, TestPlan};
use swiftest_core::test::discovery::TestItem;
use swiftest_core::test::fixtures::FixtureScope;
use swiftest_core::Config;

use crate::batch::{self, BatchMember, MemberOutcome};
use crate::capture::CaptureHandle;
use crate::event_loop::{self, LoopCache};
use crate::fixtures::{AcquireError, FixtureRuntime};
use crate::TestResult;

/// Scopes finalized at step boundaries, narrowest first. Session closes
/// only at end of run.
const BOUNDARY_SCOPES: [FixtureScope; 3] = [
    FixtureScope::Class,
    FixtureScope::Module,
    FixtureScope::Package,
];

pub struct Executor<'a> {
    config: &'a Config,
    sink: &'a dyn EventSink,
    fixtures: FixtureRuntime,
    loops: LoopCache,
}

impl<'a> Executor<'a> {
    pub fn new(config: &'a Config, sink: &'a dyn EventSink) -> Self {
        Self {
            config,
            sink,
            fixtures: FixtureRuntime::new(),
            loops: LoopCache::new(),
        }
    }

    /// Execute the plan, emitting `RunStarted` and per-test events. The
    /// caller emits `RunEnded` once the cache is rewritten.
    pub fn run(mut self, py: Python<'_>, plan: &TestPlan) -> PyResult<Vec<TestResult>> {
        crate::capture::install(py)?;
        self.sink.emit(Event::RunStarted {
            total_items: plan.total_items(),
            ascii_mode: self.config.ascii_mode,
        });

        let mut results = Vec::with_capacity(plan.total_items());
        let mut stopped = false;

        for (index, step) in plan.steps.iter().enumerate() {
            if stopped {
                break;
            }

            let step_results = match step {
                PlanStep::Single(planned) => vec![self.exec_single(py, planned)],
                PlanStep::Batch(batch) => self.exec_batch(py, batch),
            };

            if self.config.fail_fast
                && step_results.iter().any(|r| r.outcome.is_failure())
            {
                debug!("fail-fast tripped after step {index}");
                stopped = true;
            }

            let next_item = if stopped {
                None
            } else {
                plan.steps.get(index + 1).map(|next| next.first_item())
            };
            self.finalize_boundaries(py, step.last_item(), next_item);

            results.extend(step_results);
        }

        self.fixtures
            .finalize_scope(py, FixtureScope::Session, "session", &mut self.loops, None, self.sink);
        self.loops.close_all(py, self.sink);
        Ok(results)
    }

    /// Finalize every scope instance that ends between two plan steps,
    /// narrower scopes first, and close event loops whose scope ended.
    fn finalize_boundaries(
        &mut self,
        py: Python<'_>,
        current: &TestItem,
        next: Option<&TestItem>,
    ) {
        for scope in BOUNDARY_SCOPES {
            let current_key = FixtureRuntime::instance_key(current, scope);
            let next_key = next.map(|item| FixtureRuntime::instance_key(item, scope));
            if next_key.as_deref() == Some(current_key.as_str()) {
                continue;
            }
            self.fixtures.finalize_scope(
                py,
                scope,
                &current_key,
                &mut self.loops,
                None,
                self.sink,
            );
            // The loop bound to this scope instance dies with it.
            self.loops.close_key(
                py,
                &format!("{}:{}", scope.as_str(), current_key),
                self.sink,
            );
        }
    }

    fn emit_started(&self, item: &TestItem) {
        self.sink.emit(Event::TestStarted {
            id: item.id.clone(),
            path: item.path.clone(),
        });
    }

    fn emit_ended(&self, result: &TestResult) {
        self.sink.emit(Event::TestEnded {
            id: result.id.clone(),
            outcome: result.outcome,
            duration: result.duration,
            captured_stdout: result.stdout.clone(),
            captured_stderr: result.stderr.clone(),
            diagnostic: result.diagnostic.clone(),
        });
    }

    /// Pre-invocation short-circuits shared by both execution paths.
    fn short_circuit(planned: &PlannedTest) -> Option<(Outcome, Option<Diagnostic>)> {
        let item = &planned.item;
        if let Some(diagnostic) = &item.collect_error {
            return Some((Outcome::Errored, Some(diagnostic.clone())));
        }
        if let Err(resolve_error) = &planned.fixtures {
            return Some((
                Outcome::Errored,
                Some(Diagnostic::from_message(
                    "FixtureError",
                    resolve_error.to_string(),
                )),
            ));
        }
        if let Some(reason) = &item.skip {
            return Some((
                Outcome::Skipped,
                Some(Diagnostic::from_message("Skipped", reason.clone())),
            ));
        }
        None
    }

    fn exec_single(&mut self, py: Python<'_>, planned: &PlannedTest) -> TestResult {
        let item = &planned.item;
        self.emit_started(item);

        if let Some((outcome, diagnostic)) = Self::short_circuit(planned) {
            let result = TestResult::bare(item, outcome, diagnostic);
            self.emit_ended(&result);
            return result;
        }
        let order = planned
            .fixtures
            .as_ref()
            .expect("short_circuit handles resolution errors");

        let capture = match CaptureHandle::begin(py, self.config.capture_output) {
            Ok(capture) => capture,
            Err(err) => {
                let result = TestResult::bare(
                    item,
                    Outcome::Errored,
                    Some(Diagnostic::from_py_err(py, &err)),
                );
                self.emit_ended(&result);
                return result;
            }
        };

        // A lone async item owns a fresh loop; async function-scope fixtures
        // share it.
        let needs_loop = item.is_async
            || order
                .iter()
                .any(|def| def.is_async && def.scope == FixtureScope::Function);
        let item_loop = if needs_loop {
            match event_loop::new_private_loop(py) {
                Ok(event_loop) => Some(event_loop),
                Err(err) => {
                    let _ = capture.finish(py);
                    let result = TestResult::bare(
                        item,
                        Outcome::Errored,
                        Some(Diagnostic::from_py_err(py, &err)),
                    );
                    self.emit_ended(&result);
                    return result;
                }
            }
        } else {
            None
        };

        let (outcome, diagnostic, duration) =
            match self
                .fixtures
                .acquire_all(py, item, order, &mut self.loops, item_loop.as_ref())
            {
                Ok(values) => self.invoke(py, item, &values, item_loop.as_ref()),
                Err(AcquireError::Skip(reason)) => (
                    Outcome::Skipped,
                    Some(Diagnostic::from_message("Skipped", reason)),
                    Duration::ZERO,
                ),
                Err(AcquireError::Error(err)) => (
                    Outcome::Errored,
                    Some(Diagnostic::from_py_err(py, &err)),
                    Duration::ZERO,
                ),
            };

        // Function-scope teardown runs whether setup or the body raised.
        let function_key = FixtureRuntime::instance_key(item, FixtureScope::Function);
        self.fixtures.finalize_scope(
            py,
            FixtureScope::Function,
            &function_key,
            &mut self.loops,
            item_loop.as_ref(),
            self.sink,
        );
        if let Some(event_loop) = &item_loop {
            if let Err(err) = event_loop::close_private_loop(py, event_loop) {
                self.sink.emit(Event::Warning {
                    message: format!("event loop for '{}' failed to close: {err}", item.id),
                });
            }
        }

        let (stdout, stderr) = capture.finish(py).unwrap_or_default();
        let result = TestResult {
            id: item.id.clone(),
            outcome,
            duration,
            stdout,
            stderr,
            diagnostic,
        };
        self.emit_ended(&result);
        result
    }

    /// Call the test callable with its fixture values and parameter binding.
    fn invoke(
        &mut self,
        py: Python<'_>,
        item: &TestItem,
        values: &HashMap<String, Py<PyAny>>,
        item_loop: Option<&Py<PyAny>>,
    ) -> (Outcome, Option<Diagnostic>, Duration) {
        let started = Instant::now();
        // Binding trouble (no callable handle, class instantiation raised)
        // is a setup error, not a test failure.
        let call = match self.build_invocation(py, item, values) {
            Ok(call) => call,
            Err(err) => {
                return (
                    Outcome::Errored,
                    Some(Diagnostic::from_py_err(py, &err)),
                    started.elapsed(),
                );
            }
        };
        let invocation = call.and_then(|returned| {
            if item.is_async {
                let event_loop = item_loop.ok_or_else(|| {
                    pyo3::exceptions::PyRuntimeError::new_err("async item without a loop")
                })?;
                event_loop::run_until_complete(py, event_loop, &returned).map(|_| ())
            } else {
                Ok(())
            }
        });
        let duration = started.elapsed();

        match invocation {
            Ok(()) => {
                if item.xfail.is_some() {
                    (Outcome::Xpassed, None, duration)
                } else {
                    (Outcome::Passed, None, duration)
                }
            }
            Err(err) => {
                let (outcome, diagnostic) = classify_exception(py, err.value(py).as_any(), item);
                (outcome, diagnostic, duration)
            }
        }
    }

    /// Instantiate the class if any, then call the test callable. For async
    /// items the returned object is the un-awaited coroutine.
    fn build_invocation<'py>(
        &self,
        py: Python<'py>,
        item: &TestItem,
        values: &HashMap<String, Py<PyAny>>,
    ) -> PyResult<PyResult<Bound<'py, PyAny>>> {
        let kwargs = PyDict::new(py);
        for name in &item.fixture_deps {
            if let Some(value) = values.get(name) {
                kwargs.set_item(name.as_str(), value.bind(py))?;
            }
        }
        for (name, param) in &item.param_binding {
            kwargs.set_item(name.as_str(), param.value.bind(py))?;
        }

        let callable = item
            .callable
            .as_ref()
            .ok_or_else(|| {
                pyo3::exceptions::PyRuntimeError::new_err("item has no callable handle")
            })?
            .bind(py);

        let target = match &item.class_handle {
            Some(class) => {
                let instance = class.bind(py).call0()?;
                instance.getattr(item.function_name.as_str())?
            }
            None => callable.clone(),
        };
        Ok(target.call((), Some(&kwargs)))
    }

    fn exec_batch(&mut self, py: Python<'_>, batch: &AsyncBatch) -> Vec<TestResult> {
        // Starts fire in plan order before any end event.
        for planned in &batch.tests {
            self.emit_started(&planned.item);
        }

        let batch_loop = match self.loops.get_or_create(py, &batch.loop_key) {
            Ok(event_loop) => event_loop,
            Err(err) => {
                // Loop creation failure errors every member of the batch.
                let diagnostic = Diagnostic::from_py_err(py, &err);
                return batch
                    .tests
                    .iter()
                    .map(|planned| {
                        let result = TestResult::bare(
                            &planned.item,
                            Outcome::Errored,
                            Some(diagnostic.clone()),
                        );
                        self.emit_ended(&result);
                        result
                    })
                    .collect();
            }
        };

        // Sequential setup in plan order: shared fixtures land in the cache
        // once, function-scope fixtures bind each member's callable.
        enum Prepared {
            Ready { member_index: usize },
            Done(Outcome, Option<Diagnostic>),
        }
        let mut prepared = Vec::with_capacity(batch.tests.len());
        let mut members = Vec::new();
        let mut member_buffers: Vec<Option<Py<PyAny>>> = Vec::new();

        for planned in &batch.tests {
            if let Some((outcome, diagnostic)) = Self::short_circuit(planned) {
                prepared.push(Prepared::Done(outcome, diagnostic));
                continue;
            }
            let order = planned
                .fixtures
                .as_ref()
                .expect("short_circuit handles resolution errors");

            let setup = self.fixtures.acquire_all(
                py,
                &planned.item,
                order,
                &mut self.loops,
                Some(&batch_loop),
            );
            let values = match setup {
                Ok(values) => values,
                Err(AcquireError::Skip(reason)) => {
                    prepared.push(Prepared::Done(
                        Outcome::Skipped,
                        Some(Diagnostic::from_message("Skipped", reason)),
                    ));
                    continue;
                }
                Err(AcquireError::Error(err)) => {
                    self.finalize_member(py, &planned.item, &batch_loop);
                    prepared.push(Prepared::Done(
                        Outcome::Errored,
                        Some(Diagnostic::from_py_err(py, &err)),
                    ));
                    continue;
                }
            };

            let call = match self.build_invocation(py, &planned.item, &values) {
                Ok(call) => call,
                Err(err) => {
                    self.finalize_member(py, &planned.item, &batch_loop);
                    prepared.push(Prepared::Done(
                        Outcome::Errored,
                        Some(Diagnostic::from_py_err(py, &err)),
                    ));
                    continue;
                }
            };
            let coroutine = match call {
                Ok(coroutine) => coroutine.unbind(),
                Err(err) => {
                    // Calling an async test function raised before a
                    // coroutine even existed; classify like a body failure.
                    self.finalize_member(py, &planned.item, &batch_loop);
                    let (outcome, diagnostic) =
                        classify_exception(py, err.value(py).as_any(), &planned.item);
                    prepared.push(Prepared::Done(outcome, diagnostic));
                    continue;
                }
            };

            let buffers = if self.config.capture_output {
                crate::capture::new_buffers(py).ok()
            } else {
                None
            };
            member_buffers.push(buffers.as_ref().map(|b| b.clone_ref(py)));
            prepared.push(Prepared::Ready {
                member_index: members.len(),
            });
            members.push(BatchMember { coroutine, buffers });
        }

        let gathered = if members.is_empty() {
            Ok(Vec::new())
        } else {
            batch::run_batch(py, &batch_loop, members)
        };

        // Flush completions in plan order, never completion order.
        let mut results = Vec::with_capacity(batch.tests.len());
        match gathered {
            Ok(outcomes) => {
                for (planned, state) in batch.tests.iter().zip(prepared) {
                    let result = match state {
                        Prepared::Done(outcome, diagnostic) => {
                            TestResult::bare(&planned.item, outcome, diagnostic)
                        }
                        Prepared::Ready { member_index } => {
                            let (outcome, diagnostic, duration) = match &outcomes[member_index] {
                                MemberOutcome::Completed { duration } => {
                                    let outcome = if planned.item.xfail.is_some() {
                                        Outcome::Xpassed
                                    } else {
                                        Outcome::Passed
                                    };
                                    (outcome, None, *duration)
                                }
                                MemberOutcome::Raised {
                                    exception,
                                    duration,
                                } => {
                                    let (outcome, diagnostic) = classify_exception(
                                        py,
                                        exception.bind(py),
                                        &planned.item,
                                    );
                                    (outcome, diagnostic, *duration)
                                }
                            };
                            let (stdout, stderr) = member_buffers[member_index]
                                .as_ref()
                                .and_then(|buffers| {
                                    crate::capture::read_buffers(py, buffers).ok()
                                })
                                .unwrap_or_default();
                            self.finalize_member(py, &planned.item, &batch_loop);
                            TestResult {
                                id: planned.item.id.clone(),
                                outcome,
                                duration,
                                stdout,
                                stderr,
                                diagnostic,
                            }
                        }
                    };
                    self.emit_ended(&result);
                    results.push(result);
                }
            }
            Err(err) => {
                // The join primitive itself failed: every member errors.
                let diagnostic = Diagnostic::from_py_err(py, &err);
                for planned in &batch.tests {
                    self.finalize_member(py, &planned.item, &batch_loop);
                    let result = TestResult::bare(
                        &planned.item,
                        Outcome::Errored,
                        Some(diagnostic.clone()),
                    );
                    self.emit_ended(&result);
                    results.push(result);
                }
            }
        }
        results
    }

    fn finalize_member(&mut self, py: Python<'_>, item: &TestItem, batch_loop: &Py<PyAny>) {
        let key = FixtureRuntime::instance_key(item, FixtureScope::Function);
        self.fixtures.finalize_scope(
            py,
            FixtureScope::Function,
            &key,
            &mut self.loops,
            Some(batch_loop),
            self.sink,
        );
    }
}

/// Classify an exception raised by user code, per the outcome taxonomy.
fn classify_exception(
    py: Python<'_>,
    exception: &Bound<'_, PyAny>,
    item: &TestItem,
) -> (Outcome, Option<Diagnostic>) {
    if let Ok(skipped) = interp::skipped_type(py) {
        if exception.is_instance(&skipped).unwrap_or(false) {
            let reason = exception
                .str()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "skipped".to_string());
            return (
                Outcome::Skipped,
                Some(Diagnostic::from_message("Skipped", reason)),
            );
        }
    }
    if let Ok(xfailed) = interp::xfailed_type(py) {
        if exception.is_instance(&xfailed).unwrap_or(false) {
            return (Outcome::Xfailed, None);
        }
    }
    if let Some(spec) = &item.xfail {
        let matches_expected = match &spec.raises {
            None => true,
            Some(expected) => exception
                .is_instance(expected.bind(py))
                .unwrap_or(false),
        };
        if matches_expected {
            return (Outcome::Xfailed, None);
        }
    }
    (
        Outcome::Failed,
        Some(Diagnostic::from_exception(py, exception)),
    )
}
