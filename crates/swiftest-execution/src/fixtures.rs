//! Fixture acquisition and lifecycle.
//!
//! Values are cached per (fixture identity, parameter index, scope-instance
//! key): a scope instance of a fixture is created at most once and finalized
//! exactly once, LIFO within the scope. Yield-style fixtures register a
//! finalizer that resumes the generator past its yield point when the scope
//! instance ends.

use std::collections::HashMap;
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use swiftest_core::events::{Event, EventSink};
use swiftest_core::interp;
use swiftest_core::test::discovery::TestItem;
use swiftest_core::test::fixtures::{FixtureDef, FixtureScope};

use crate::event_loop::{self, LoopCache};

/// Why acquisition stopped.
pub enum AcquireError {
    /// A fixture (or user `skip()` during setup) asked to skip the test.
    Skip(String),
    /// A fixture callable raised.
    Error(PyErr),
}

enum FinalizerKind {
    Generator(Py<PyAny>),
    AsyncGenerator {
        generator: Py<PyAny>,
        /// Loop-cache key for wider-scope fixtures; `None` means the
        /// function-scope loop supplied at finalize time.
        loop_key: Option<String>,
    },
}

struct Finalizer {
    fixture_name: String,
    kind: FinalizerKind,
}

type ScopeInstance = (FixtureScope, String);

/// Runtime state for fixture values and pending finalizers.
#[derive(Default)]
pub struct FixtureRuntime {
    values: HashMap<String, Py<PyAny>>,
    /// Cache keys owned by each live scope instance, for eviction.
    owned_keys: HashMap<ScopeInstance, Vec<String>>,
    /// LIFO queues of pending finalizers per scope instance.
    finalizers: HashMap<ScopeInstance, Vec<Finalizer>>,
}

impl FixtureRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope-instance key for a fixture scope relative to one item. A
    /// class-scope fixture requested outside any class degrades to module
    /// sharing. The executor uses the same keys to detect scope boundaries.
    pub fn instance_key(item: &TestItem, scope: FixtureScope) -> String {
        item.scope_key(scope)
            .or_else(|| item.scope_key(FixtureScope::Module))
            .unwrap_or_else(|| item.id.clone())
    }

    fn loop_key_for(scope: FixtureScope, scope_key: &str) -> String {
        format!("{}:{}", scope.as_str(), scope_key)
    }

    /// Acquire every fixture in resolved order, returning name → value for
    /// injection. `function_loop` is the loop function-scope async fixtures
    /// run on (the item's own loop, or the batch loop for batched items).
    pub fn acquire_all(
        &mut self,
        py: Python<'_>,
        item: &TestItem,
        order: &[Arc<FixtureDef>],
        loops: &mut LoopCache,
        function_loop: Option<&Py<PyAny>>,
    ) -> Result<HashMap<String, Py<PyAny>>, AcquireError> {
        let mut acquired: HashMap<String, Py<PyAny>> = HashMap::new();
        for def in order {
            let value = self
                .acquire_one(py, item, def, &acquired, loops, function_loop)
                .map_err(|err| self.classify_acquire_error(py, err))?;
            acquired.insert(def.name.clone(), value);
        }
        Ok(acquired)
    }

    fn classify_acquire_error(&self, py: Python<'_>, err: PyErr) -> AcquireError {
        if let Ok(skipped) = interp::skipped_type(py) {
            if err.value(py).is_instance(&skipped).unwrap_or(false) {
                let reason = err
                    .value(py)
                    .str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "skipped".to_string());
                return AcquireError::Skip(reason);
            }
        }
        AcquireError::Error(err)
    }

    fn acquire_one(
        &mut self,
        py: Python<'_>,
        item: &TestItem,
        def: &Arc<FixtureDef>,
        acquired: &HashMap<String, Py<PyAny>>,
        loops: &mut LoopCache,
        function_loop: Option<&Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let param_index = item
            .fixture_params
            .iter()
            .find(|(name, _)| *name == def.name)
            .map(|(_, index)| *index);
        let scope_key = Self::instance_key(item, def.scope);
        let cache_key = format!(
            "{}[{}]::{}",
            def.identity(),
            param_index.map_or_else(|| "-".to_string(), |i| i.to_string()),
            scope_key,
        );

        if let Some(cached) = self.values.get(&cache_key) {
            return Ok(cached.clone_ref(py));
        }

        // Build the kwargs from dependencies resolved earlier in the order.
        let kwargs = PyDict::new(py);
        for dep in &def.dependencies {
            if let Some(value) = acquired.get(dep) {
                kwargs.set_item(dep.as_str(), value.bind(py))?;
            }
        }
        if def.wants_request || def.is_parametric() {
            let param = param_index.and_then(|index| def.params.get(index));
            let param_bound = param.map(|p| p.bind(py).clone());
            let request = interp::fixture_request(py, param_bound.as_ref(), &item.id)?;
            kwargs.set_item("request", request)?;
        }

        let callable = def.callable.bind(py);
        let produced = callable.call((), Some(&kwargs))?;

        let scope_instance = (def.scope, scope_key.clone());
        let value: Py<PyAny> = match (def.is_generator, def.is_async) {
            (false, false) => produced.unbind(),
            (true, false) => {
                // Yield-style: run to the yield point, keep the generator
                // for teardown.
                let yielded = produced.call_method0("__next__")?;
                self.push_finalizer(
                    scope_instance.clone(),
                    Finalizer {
                        fixture_name: def.name.clone(),
                        kind: FinalizerKind::Generator(produced.unbind()),
                    },
                );
                yielded.unbind()
            }
            (false, true) => {
                // Coroutine fixture: await the value on the owning loop.
                let event_loop =
                    self.loop_for(py, def.scope, &scope_key, loops, function_loop)?;
                event_loop::run_until_complete(py, &event_loop, &produced)?.unbind()
            }
            (true, true) => {
                let event_loop =
                    self.loop_for(py, def.scope, &scope_key, loops, function_loop)?;
                let step = produced.call_method0("__anext__")?;
                let yielded = event_loop::run_until_complete(py, &event_loop, &step)?;
                let loop_key = (def.scope != FixtureScope::Function)
                    .then(|| Self::loop_key_for(def.scope, &scope_key));
                self.push_finalizer(
                    scope_instance.clone(),
                    Finalizer {
                        fixture_name: def.name.clone(),
                        kind: FinalizerKind::AsyncGenerator {
                            generator: produced.unbind(),
                            loop_key,
                        },
                    },
                );
                yielded.unbind()
            }
        };

        self.values.insert(cache_key.clone(), value.clone_ref(py));
        self.owned_keys
            .entry(scope_instance)
            .or_default()
            .push(cache_key);
        Ok(value)
    }

    fn loop_for(
        &self,
        py: Python<'_>,
        scope: FixtureScope,
        scope_key: &str,
        loops: &mut LoopCache,
        function_loop: Option<&Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        if scope == FixtureScope::Function {
            return match function_loop {
                Some(event_loop) => Ok(event_loop.clone_ref(py)),
                None => Err(pyo3::exceptions::PyRuntimeError::new_err(
                    "async function-scope fixture acquired without an event loop",
                )),
            };
        }
        loops.get_or_create(py, &Self::loop_key_for(scope, scope_key))
    }

    fn push_finalizer(&mut self, scope_instance: ScopeInstance, finalizer: Finalizer) {
        self.finalizers
            .entry(scope_instance)
            .or_default()
            .push(finalizer);
    }

    /// Run a scope instance's finalizers LIFO and evict its cached values.
    /// Finalizer errors are warnings: every finalizer is still attempted and
    /// the run never halts.
    pub fn finalize_scope(
        &mut self,
        py: Python<'_>,
        scope: FixtureScope,
        key: &str,
        loops: &mut LoopCache,
        function_loop: Option<&Py<PyAny>>,
        sink: &dyn EventSink,
    ) {
        let instance = (scope, key.to_string());
        if let Some(pending) = self.finalizers.remove(&instance) {
            for finalizer in pending.into_iter().rev() {
                if let Err(message) = run_finalizer(py, &finalizer, loops, function_loop) {
                    sink.emit(Event::Warning {
                        message: format!(
                            "finalizer for fixture '{}' failed: {message}",
                            finalizer.fixture_name
                        ),
                    });
                }
            }
        }
        if let Some(keys) = self.owned_keys.remove(&instance) {
            for cache_key in keys {
                self.values.remove(&cache_key);
            }
        }
    }
}

fn run_finalizer(
    py: Python<'_>,
    finalizer: &Finalizer,
    loops: &mut LoopCache,
    function_loop: Option<&Py<PyAny>>,
) -> Result<(), String> {
    match &finalizer.kind {
        FinalizerKind::Generator(generator) => {
            match generator.bind(py).call_method0("__next__") {
                Ok(_) => Err("fixture yielded more than once".to_string()),
                Err(err) if err.is_instance_of::<pyo3::exceptions::PyStopIteration>(py) => Ok(()),
                Err(err) => Err(err.to_string()),
            }
        }
        FinalizerKind::AsyncGenerator {
            generator,
            loop_key,
        } => {
            let known = match loop_key {
                Some(key) => loops.get(py, key),
                None => function_loop.map(|l| l.clone_ref(py)),
            };
            // If the owning loop is already gone, drain on a throwaway loop.
            let temporary = known.is_none();
            let event_loop = match known {
                Some(event_loop) => event_loop,
                None => event_loop::new_private_loop(py).map_err(|e| e.to_string())?,
            };
            let step = generator
                .bind(py)
                .call_method0("__anext__")
                .map_err(|e| e.to_string())?;
            let outcome = match event_loop::run_until_complete(py, &event_loop, &step) {
                Ok(_) => Err("fixture yielded more than once".to_string()),
                Err(err)
                    if err.is_instance_of::<pyo3::exceptions::PyStopAsyncIteration>(py) =>
                {
                    Ok(())
                }
                Err(err) => Err(err.to_string()),
            };
            if temporary {
                let _ = event_loop::close_private_loop(py, &event_loop);
            }
            outcome
        }
    }
}
