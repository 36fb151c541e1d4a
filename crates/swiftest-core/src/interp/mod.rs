//! Embedded-interpreter plumbing.
//!
//! Installs the `swiftest` marker surface into `sys.modules` before any test
//! module is imported, prepends source roots to `sys.path`, imports test
//! files by path, and probes user callables once at discovery time. User
//! callables are opaque handles everywhere else; nothing outside this module
//! re-checks attributes in the hot path.

use std::ffi::CString;
use std::path::Path;

use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::{PyDict, PyModule};

/// Host-side surface that user test files import. Decorators only tag
/// callables with recognised attributes; discovery reads the tags.
const BOOTSTRAP_SOURCE: &str = r#"
"""Marker surface installed by the swiftest runner."""
import inspect


class Skipped(Exception):
    """Raised to short-circuit a test or a fixture setup."""

    def __init__(self, reason="skipped"):
        super().__init__(reason)
        self.reason = reason


class XFailed(Exception):
    """Raised to declare an expected failure from inside a test body."""

    def __init__(self, reason="expected failure"):
        super().__init__(reason)
        self.reason = reason


class FixtureRequest:
    """Request object handed to fixtures that ask for one."""

    def __init__(self, param=None, node_id=None):
        self.param = param
        self.node_id = node_id


def skip(reason="skipped"):
    raise Skipped(reason)


def xfail(reason="expected failure"):
    raise XFailed(reason)


def fixture(func=None, *, scope="function", params=None, autouse=False, ids=None, name=None):
    def decorate(f):
        f.__swiftest_fixture__ = {
            "scope": scope,
            "params": None if params is None else list(params),
            "autouse": bool(autouse),
            "ids": ids,
            "name": name or f.__name__,
        }
        return f

    if func is not None:
        return decorate(func)
    return decorate


def _add_mark(obj, entry):
    marks = list(getattr(obj, "__swiftest_marks__", ()))
    marks.append(entry)
    obj.__swiftest_marks__ = marks
    return obj


class _Mark:
    def parametrize(self, argnames, argvalues, ids=None):
        if isinstance(argnames, str):
            names = [n.strip() for n in argnames.split(",") if n.strip()]
        else:
            names = list(argnames)
        return lambda obj: _add_mark(
            obj,
            {
                "kind": "parametrize",
                "argnames": names,
                "argvalues": list(argvalues),
                "ids": ids,
            },
        )

    def skip(self, reason="skipped"):
        return lambda obj: _add_mark(obj, {"kind": "skip", "reason": reason})

    def skipif(self, condition, *, reason="conditional skip"):
        return lambda obj: _add_mark(
            obj, {"kind": "skipif", "condition": bool(condition), "reason": reason}
        )

    def xfail(self, raises=None, reason=None):
        return lambda obj: _add_mark(
            obj, {"kind": "xfail", "raises": raises, "reason": reason}
        )

    def asyncio(self, loop_scope="module"):
        return lambda obj: _add_mark(
            obj, {"kind": "asyncio", "loop_scope": loop_scope}
        )


mark = _Mark()


def probe(obj):
    """Signature probe used once per callable at discovery time."""
    try:
        params = [
            p
            for p in inspect.signature(obj).parameters
            if p not in ("self", "cls")
        ]
    except (TypeError, ValueError):
        params = []
    try:
        line = obj.__code__.co_firstlineno
    except AttributeError:
        line = 0
    return {
        "params": params,
        "is_coroutine": inspect.iscoroutinefunction(obj),
        "is_generator": inspect.isgeneratorfunction(obj),
        "is_async_generator": inspect.isasyncgenfunction(obj),
        "line": line,
    }
"#;

pub const BOOTSTRAP_MODULE: &str = "swiftest";

static BOOTSTRAP: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

/// Install the marker surface. Idempotent; every entry point that touches
/// user code calls this first.
pub fn ensure_bootstrap(py: Python<'_>) -> PyResult<&Py<PyModule>> {
    BOOTSTRAP.get_or_try_init(py, || {
        let source = CString::new(BOOTSTRAP_SOURCE).expect("embedded source has no NUL");
        let module = PyModule::from_code(
            py,
            source.as_c_str(),
            c"swiftest/__init__.py",
            c"swiftest",
        )?;
        py.import("sys")?
            .getattr("modules")?
            .set_item(BOOTSTRAP_MODULE, &module)?;
        Ok(module.unbind())
    })
}

/// Prepend source roots to the interpreter's import search path, first root
/// ending up first. Roots already present are left where they are.
pub fn prepend_sys_path(py: Python<'_>, roots: &[&Path]) -> PyResult<()> {
    let sys_path = py.import("sys")?.getattr("path")?;
    for root in roots.iter().rev() {
        let entry = root.to_string_lossy().into_owned();
        if !sys_path.contains(entry.as_str())? {
            sys_path.call_method1("insert", (0, entry.as_str()))?;
        }
    }
    Ok(())
}

/// Derive a stable module name from a path relative to the project root.
pub fn module_name_for(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut name = String::new();
    for component in rel.components() {
        if !name.is_empty() {
            name.push('_');
        }
        for ch in component.as_os_str().to_string_lossy().chars() {
            name.push(if ch.is_ascii_alphanumeric() { ch } else { '_' });
        }
    }
    match name.strip_suffix("_py") {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

/// Import a file through the interpreter so its top-level definitions become
/// observable. The module is registered in `sys.modules` under a name
/// derived from its path.
pub fn import_by_path<'py>(
    py: Python<'py>,
    path: &Path,
    root: &Path,
) -> PyResult<Bound<'py, PyModule>> {
    ensure_bootstrap(py)?;
    let module_name = module_name_for(path, root);
    let path_str = path.to_string_lossy().into_owned();

    let util = py.import("importlib.util")?;
    let spec = util.call_method1(
        "spec_from_file_location",
        (module_name.as_str(), path_str.as_str()),
    )?;
    let module = util.call_method1("module_from_spec", (&spec,))?;
    py.import("sys")?
        .getattr("modules")?
        .set_item(module_name.as_str(), &module)?;
    spec.getattr("loader")?
        .call_method1("exec_module", (&module,))?;
    module.downcast_into::<PyModule>().map_err(Into::into)
}

/// Everything the runner ever needs to know about a user callable,
/// captured once.
#[derive(Debug, Clone, Default)]
pub struct SignatureProbe {
    pub params: Vec<String>,
    pub is_coroutine: bool,
    pub is_generator: bool,
    pub is_async_generator: bool,
    pub line: usize,
}

pub fn probe_callable(py: Python<'_>, obj: &Bound<'_, PyAny>) -> PyResult<SignatureProbe> {
    let bootstrap = ensure_bootstrap(py)?.bind(py);
    let raw = bootstrap.call_method1("probe", (obj,))?;
    let raw = raw.downcast::<PyDict>()?;
    let get_bool = |key: &str| -> PyResult<bool> {
        Ok(raw
            .get_item(key)?
            .map(|v| v.is_truthy())
            .transpose()?
            .unwrap_or(false))
    };
    let params = match raw.get_item("params")? {
        Some(list) => list.extract::<Vec<String>>()?,
        None => Vec::new(),
    };
    let line = match raw.get_item("line")? {
        Some(value) => value.extract::<usize>().unwrap_or(0),
        None => 0,
    };
    Ok(SignatureProbe {
        params,
        is_coroutine: get_bool("is_coroutine")?,
        is_generator: get_bool("is_generator")?,
        is_async_generator: get_bool("is_async_generator")?,
        line,
    })
}

/// The `Skipped` sentinel class.
pub fn skipped_type(py: Python<'_>) -> PyResult<Bound<'_, PyAny>> {
    ensure_bootstrap(py)?.bind(py).getattr("Skipped")
}

/// The `XFailed` sentinel class.
pub fn xfailed_type(py: Python<'_>) -> PyResult<Bound<'_, PyAny>> {
    ensure_bootstrap(py)?.bind(py).getattr("XFailed")
}

/// Construct a `FixtureRequest` carrying the current parameter binding.
pub fn fixture_request<'py>(
    py: Python<'py>,
    param: Option<&Bound<'py, PyAny>>,
    node_id: &str,
) -> PyResult<Bound<'py, PyAny>> {
    let bootstrap = ensure_bootstrap(py)?.bind(py);
    let cls = bootstrap.getattr("FixtureRequest")?;
    let kwargs = PyDict::new(py);
    if let Some(param) = param {
        kwargs.set_item("param", param)?;
    }
    kwargs.set_item("node_id", node_id)?;
    cls.call((), Some(&kwargs))
}
