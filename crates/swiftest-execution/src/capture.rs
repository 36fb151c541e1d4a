//! Per-item stdout/stderr capture.
//!
//! One router pair is installed over `sys.stdout`/`sys.stderr` for the whole
//! run; the write target is a contextvar holding per-item `StringIO` buffers.
//! Sync items bind the contextvar around invocation; batch members bind it
//! inside their own task context, which asyncio copies at task creation, so
//! concurrent output never bleeds between tests.

use std::ffi::CString;

use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::PyModule;

const CAPTURE_MODULE: &str = "_swiftest_capture";

const CAPTURE_SOURCE: &str = r#"
import contextvars
import io
import sys

_target = contextvars.ContextVar("swiftest_capture_target", default=None)


class _Router(io.TextIOBase):
    def __init__(self, real, index):
        self._real = real
        self._index = index

    def writable(self):
        return True

    def write(self, data):
        sink = _target.get()
        stream = self._real if sink is None else sink[self._index]
        return stream.write(data)

    def flush(self):
        sink = _target.get()
        stream = self._real if sink is None else sink[self._index]
        stream.flush()

    def isatty(self):
        return False


def install():
    if not isinstance(sys.stdout, _Router):
        sys.stdout = _Router(sys.stdout, 0)
    if not isinstance(sys.stderr, _Router):
        sys.stderr = _Router(sys.stderr, 1)


def new_buffers():
    return (io.StringIO(), io.StringIO())


def bind(buffers):
    return _target.set(buffers)


def unbind(token):
    _target.reset(token)


def read(buffers):
    return (buffers[0].getvalue(), buffers[1].getvalue())
"#;

static CAPTURE: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

fn capture_module(py: Python<'_>) -> PyResult<&Py<PyModule>> {
    CAPTURE.get_or_try_init(py, || {
        let source = CString::new(CAPTURE_SOURCE).expect("embedded source has no NUL");
        let module = PyModule::from_code(
            py,
            source.as_c_str(),
            c"_swiftest_capture.py",
            c"_swiftest_capture",
        )?;
        py.import("sys")?
            .getattr("modules")?
            .set_item(CAPTURE_MODULE, &module)?;
        Ok(module.unbind())
    })
}

/// Install the router pair over the real streams. Idempotent.
pub fn install(py: Python<'_>) -> PyResult<()> {
    capture_module(py)?.bind(py).call_method0("install")?;
    Ok(())
}

/// A fresh `(StringIO, StringIO)` pair for one item.
pub fn new_buffers(py: Python<'_>) -> PyResult<Py<PyAny>> {
    Ok(capture_module(py)?
        .bind(py)
        .call_method0("new_buffers")?
        .unbind())
}

/// Drain a buffer pair into owned strings.
pub fn read_buffers(py: Python<'_>, buffers: &Py<PyAny>) -> PyResult<(String, String)> {
    capture_module(py)?
        .bind(py)
        .call_method1("read", (buffers.bind(py),))?
        .extract()
}

/// Captures output on the calling thread until `finish` is called. The
/// no-capture variant yields empty strings and touches nothing.
pub struct CaptureHandle {
    state: Option<(Py<PyAny>, Py<PyAny>)>,
}

impl CaptureHandle {
    /// Begin capturing, or return an inert handle when capture is disabled.
    pub fn begin(py: Python<'_>, enabled: bool) -> PyResult<Self> {
        if !enabled {
            return Ok(Self { state: None });
        }
        let module = capture_module(py)?.bind(py);
        let buffers = module.call_method0("new_buffers")?.unbind();
        let token = module.call_method1("bind", (buffers.bind(py),))?.unbind();
        Ok(Self {
            state: Some((buffers, token)),
        })
    }

    /// Stop capturing and return the captured (stdout, stderr).
    pub fn finish(self, py: Python<'_>) -> PyResult<(String, String)> {
        let Some((buffers, token)) = self.state else {
            return Ok((String::new(), String::new()));
        };
        let module = capture_module(py)?.bind(py);
        module.call_method1("unbind", (token.bind(py),))?;
        module
            .call_method1("read", (buffers.bind(py),))?
            .extract()
    }
}
