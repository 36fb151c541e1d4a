//! Structured diagnostics extracted from host-interpreter exceptions.
//!
//! A `Diagnostic` is pure data; colour, unicode and hyperlinking are the
//! renderer's concern. The traceback walk and the assertion-operand probe run
//! host-side, where frame locals are still alive, and hand a JSON payload
//! back across the boundary.

use std::ffi::CString;

use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::PyModule;
use serde::{Deserialize, Serialize};

/// One frame of the exception's traceback, innermost last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticFrame {
    pub path: String,
    pub line: usize,
    pub function: String,
    pub source: String,
}

/// One line of source context around the failing line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLine {
    pub line: usize,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub exc_type: String,
    pub message: String,
    #[serde(default)]
    pub frames: Vec<DiagnosticFrame>,
    #[serde(default)]
    pub context: Vec<ContextLine>,
    /// Repr of the left operand of a failed binary-comparison assertion.
    #[serde(default)]
    pub received: Option<String>,
    /// Repr of the right operand of a failed binary-comparison assertion.
    #[serde(default)]
    pub expected: Option<String>,
}

const ENRICH_MODULE: &str = "_swiftest_enrich";

const ENRICH_SOURCE: &str = r#"
import json
import linecache
import re
import traceback

_BINARY_ASSERT = re.compile(
    r"^\s*assert\s+(.+?)\s+(==|!=|<=|>=|<|>)\s+(.+?)\s*(?:,.*)?$"
)


def enrich(exc):
    frames = []
    deepest = None
    tb = exc.__traceback__
    while tb is not None:
        frame = tb.tb_frame
        lineno = tb.tb_lineno
        path = frame.f_code.co_filename
        source = linecache.getline(path, lineno).rstrip("\n")
        frames.append(
            {
                "path": path,
                "line": lineno,
                "function": frame.f_code.co_name,
                "source": source,
            }
        )
        deepest = (frame, lineno, path, source)
        tb = tb.tb_next

    context = []
    received = None
    expected = None
    if deepest is not None:
        frame, lineno, path, source = deepest
        for n in range(max(1, lineno - 1), lineno + 2):
            text = linecache.getline(path, n)
            if text:
                context.append({"line": n, "source": text.rstrip("\n")})
        if isinstance(exc, AssertionError):
            match = _BINARY_ASSERT.match(source)
            if match is not None:
                namespace = dict(frame.f_globals)
                namespace.update(frame.f_locals)
                try:
                    received = repr(eval(match.group(1), namespace))
                    expected = repr(eval(match.group(3), namespace))
                except Exception:
                    received = None
                    expected = None

    return json.dumps(
        {
            "exc_type": type(exc).__name__,
            "message": str(exc),
            "frames": frames,
            "context": context,
            "received": received,
            "expected": expected,
        }
    )
"#;

static ENRICH: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

fn enrich_module(py: Python<'_>) -> PyResult<&Py<PyModule>> {
    ENRICH.get_or_try_init(py, || {
        let source = CString::new(ENRICH_SOURCE).expect("embedded source has no NUL");
        let module = PyModule::from_code(
            py,
            source.as_c_str(),
            c"_swiftest_enrich.py",
            c"_swiftest_enrich",
        )?;
        py.import("sys")?
            .getattr("modules")?
            .set_item(ENRICH_MODULE, &module)?;
        Ok(module.unbind())
    })
}

impl Diagnostic {
    /// Build a diagnostic that carries a message but no traceback, for
    /// failures that never touched the interpreter (missing fixtures, cycles,
    /// broken ancestor configuration).
    pub fn from_message(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            message: message.into(),
            frames: Vec::new(),
            context: Vec::new(),
            received: None,
            expected: None,
        }
    }

    /// Enrich a live exception object.
    pub fn from_exception(py: Python<'_>, exc: &Bound<'_, PyAny>) -> Self {
        let fallback = |exc: &Bound<'_, PyAny>| {
            let exc_type = exc
                .get_type()
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| "Exception".to_string());
            let message = exc.str().map(|s| s.to_string()).unwrap_or_default();
            Self::from_message(exc_type, message)
        };

        let Ok(module) = enrich_module(py) else {
            return fallback(exc);
        };
        let payload = module
            .bind(py)
            .call_method1("enrich", (exc,))
            .and_then(|json| json.extract::<String>());
        match payload {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|_| fallback(exc)),
            Err(_) => fallback(exc),
        }
    }

    /// Enrich a `PyErr` raised through the pyo3 boundary.
    pub fn from_py_err(py: Python<'_>, err: &PyErr) -> Self {
        Self::from_exception(py, err.value(py).as_any())
    }
}
