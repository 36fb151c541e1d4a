//! The async batch driver.
//!
//! Member coroutines are wrapped host-side so every member reports
//! `(status, exception, duration)` instead of propagating — one failure
//! never aborts its peers — then gathered on the batch's loop. The wrapper
//! also binds the member's capture buffers inside its own task context.

use std::ffi::CString;
use std::time::Duration;

use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::{PyList, PyModule};

const BATCH_SOURCE: &str = r#"
import asyncio
import time

import _swiftest_capture as _capture


async def _member(coro, buffers):
    if buffers is not None:
        _capture.bind(buffers)
    start = time.perf_counter()
    try:
        await coro
    except BaseException as exc:
        return ("raised", exc, time.perf_counter() - start)
    return ("ok", None, time.perf_counter() - start)


async def _gather_all(wrapped):
    # gather must be created while the loop is running, so it lands on it.
    return await asyncio.gather(*wrapped, return_exceptions=True)


def run_batch(loop, members):
    wrapped = [_member(coro, buffers) for (coro, buffers) in members]
    return loop.run_until_complete(_gather_all(wrapped))
"#;

static BATCH: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

fn batch_module(py: Python<'_>) -> PyResult<&Py<PyModule>> {
    BATCH.get_or_try_init(py, || {
        // The driver imports the capture router; make sure it exists first.
        crate::capture::install(py)?;
        let source = CString::new(BATCH_SOURCE).expect("embedded source has no NUL");
        let module = PyModule::from_code(
            py,
            source.as_c_str(),
            c"_swiftest_batch.py",
            c"_swiftest_batch",
        )?;
        Ok(module.unbind())
    })
}

/// What one gathered member came back with.
pub enum MemberOutcome {
    /// Normal return.
    Completed { duration: Duration },
    /// The member raised; the exception object is preserved for
    /// classification.
    Raised {
        exception: Py<PyAny>,
        duration: Duration,
    },
}

/// A member ready for submission: the un-awaited coroutine plus its capture
/// buffers (or `None` when capture is disabled).
pub struct BatchMember {
    pub coroutine: Py<PyAny>,
    pub buffers: Option<Py<PyAny>>,
}

/// Submit all members to the loop at once and await their joint completion.
/// The result order equals submission order.
pub fn run_batch(
    py: Python<'_>,
    event_loop: &Py<PyAny>,
    members: Vec<BatchMember>,
) -> PyResult<Vec<MemberOutcome>> {
    let entries = PyList::empty(py);
    for member in &members {
        let buffers = match &member.buffers {
            Some(buffers) => buffers.bind(py).clone(),
            None => py.None().into_bound(py),
        };
        entries.append((member.coroutine.bind(py), buffers))?;
    }

    let results = batch_module(py)?
        .bind(py)
        .call_method1("run_batch", (event_loop.bind(py), entries))?;

    let mut outcomes = Vec::with_capacity(members.len());
    for result in results.try_iter()? {
        let result = result?;
        let status: String = result.get_item(0)?.extract()?;
        let duration = Duration::from_secs_f64(result.get_item(2)?.extract::<f64>()?);
        match status.as_str() {
            "ok" => outcomes.push(MemberOutcome::Completed { duration }),
            _ => outcomes.push(MemberOutcome::Raised {
                exception: result.get_item(1)?.unbind(),
                duration,
            }),
        }
    }
    Ok(outcomes)
}
