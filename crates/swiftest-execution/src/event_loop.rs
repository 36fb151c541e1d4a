//! Cooperative event loop lifecycle.
//!
//! Loops are created lazily, bound to a loop-scope key, reused for every
//! async fixture acquisition and async batch resolving to the same key, and
//! closed exactly when their scope instance ends. Teardown trouble is
//! reported as a warning event and never terminates the run.

use std::collections::HashMap;
use std::ffi::CString;

use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::PyModule;
use swiftest_core::events::{Event, EventSink};

const LOOPS_SOURCE: &str = r#"
import asyncio


def new_loop():
    return asyncio.new_event_loop()


def run(loop, awaitable):
    return loop.run_until_complete(awaitable)


def close_loop(loop):
    pending = asyncio.all_tasks(loop)
    for task in pending:
        task.cancel()
    if pending:
        loop.run_until_complete(asyncio.gather(*pending, return_exceptions=True))
    loop.run_until_complete(loop.shutdown_asyncgens())
    loop.close()
"#;

static LOOPS: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

fn loops_module(py: Python<'_>) -> PyResult<&Py<PyModule>> {
    LOOPS.get_or_try_init(py, || {
        let source = CString::new(LOOPS_SOURCE).expect("embedded source has no NUL");
        let module = PyModule::from_code(
            py,
            source.as_c_str(),
            c"_swiftest_loops.py",
            c"_swiftest_loops",
        )?;
        Ok(module.unbind())
    })
}

/// Create a loop not owned by any scope key; the caller closes it.
pub fn new_private_loop(py: Python<'_>) -> PyResult<Py<PyAny>> {
    Ok(loops_module(py)?.bind(py).call_method0("new_loop")?.unbind())
}

/// Run an awaitable to completion on a loop.
pub fn run_until_complete<'py>(
    py: Python<'py>,
    event_loop: &Py<PyAny>,
    awaitable: &Bound<'py, PyAny>,
) -> PyResult<Bound<'py, PyAny>> {
    loops_module(py)?
        .bind(py)
        .call_method1("run", (event_loop.bind(py), awaitable))
}

/// Cancel surviving tasks and close a loop.
pub fn close_private_loop(py: Python<'_>, event_loop: &Py<PyAny>) -> PyResult<()> {
    loops_module(py)?
        .bind(py)
        .call_method1("close_loop", (event_loop.bind(py),))?;
    Ok(())
}

/// Scope-keyed loop cache.
#[derive(Default)]
pub struct LoopCache {
    loops: HashMap<String, Py<PyAny>>,
}

impl LoopCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, py: Python<'_>, key: &str) -> PyResult<Py<PyAny>> {
        if let Some(existing) = self.loops.get(key) {
            return Ok(existing.clone_ref(py));
        }
        let created = new_private_loop(py)?;
        self.loops.insert(key.to_string(), created.clone_ref(py));
        Ok(created)
    }

    pub fn get(&self, py: Python<'_>, key: &str) -> Option<Py<PyAny>> {
        self.loops.get(key).map(|l| l.clone_ref(py))
    }

    /// Close the loop bound to `key`, if one was ever created.
    pub fn close_key(&mut self, py: Python<'_>, key: &str, sink: &dyn EventSink) {
        if let Some(event_loop) = self.loops.remove(key) {
            if let Err(err) = close_private_loop(py, &event_loop) {
                sink.emit(Event::Warning {
                    message: format!("event loop for '{key}' failed to close: {err}"),
                });
            }
        }
    }

    pub fn close_all(&mut self, py: Python<'_>, sink: &dyn EventSink) {
        let keys: Vec<String> = self.loops.keys().cloned().collect();
        for key in keys {
            self.close_key(py, &key, sink);
        }
    }
}
