//! Fixture definitions and the scope-addressable registry.
//!
//! Fixtures are recognised at discovery time through the
//! `__swiftest_fixture__` attribute set by the bootstrap decorator and
//! stored as explicit registration records; nothing re-checks attributes at
//! execution time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::interp::SignatureProbe;
use crate::test::markers::IdSource;
use crate::test::parametrize::{default_id, sanitize_id};

/// How long a fixture value is cached and shared, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    Function,
    Class,
    Module,
    Package,
    Session,
}

impl FixtureScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "module" => Some(Self::Module),
            "package" => Some(Self::Package),
            "session" => Some(Self::Session),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Module => "module",
            Self::Package => "package",
            Self::Session => "session",
        }
    }
}

/// A registered fixture.
#[derive(Debug)]
pub struct FixtureDef {
    pub name: String,
    pub scope: FixtureScope,
    pub autouse: bool,
    /// Yield-style: the callable yields once, then finalizes.
    pub is_generator: bool,
    /// Coroutine or async-generator callable.
    pub is_async: bool,
    pub params: Vec<Py<PyAny>>,
    pub ids: IdSource,
    /// Dependency fixture names from the signature probe, `request` excluded.
    pub dependencies: Vec<String>,
    pub callable: Py<PyAny>,
    /// Whether the callable declares a `request` parameter.
    pub wants_request: bool,
    /// Defining file; conftest fixtures are visible beneath their directory.
    pub path: PathBuf,
    pub from_conftest: bool,
    pub line_number: usize,
}

impl FixtureDef {
    /// Identity used for cache keys and self-exclusion during lookup; two
    /// registrations of the same function (e.g. a fixture imported into a
    /// test module) still disambiguate by origin.
    pub fn identity(&self) -> String {
        format!("{}@{}:{}", self.name, self.path.display(), self.line_number)
    }

    pub fn is_parametric(&self) -> bool {
        !self.params.is_empty()
    }

    /// Display id for one of this fixture's parameters.
    pub fn param_id(&self, py: Python<'_>, index: usize) -> String {
        let Some(value) = self.params.get(index) else {
            return index.to_string();
        };
        match &self.ids {
            IdSource::List(ids) => {
                if let Some(id) = ids.get(index) {
                    return sanitize_id(id);
                }
            }
            IdSource::Callable(func) => {
                if let Some(id) = func
                    .bind(py)
                    .call1((value.bind(py),))
                    .ok()
                    .filter(|id| !id.is_none())
                    .and_then(|id| id.extract::<String>().ok())
                {
                    return sanitize_id(&id);
                }
            }
            IdSource::Default => {}
        }
        default_id(value.bind(py), &self.name, index)
    }

    /// Build a definition from a tagged callable and its probe.
    pub fn from_tagged(
        obj: &Bound<'_, PyAny>,
        meta: &Bound<'_, PyDict>,
        probe: &SignatureProbe,
        path: &Path,
        from_conftest: bool,
    ) -> PyResult<Self> {
        let name: String = match meta.get_item("name")? {
            Some(name) if !name.is_none() => name.extract()?,
            _ => obj.getattr("__name__")?.extract()?,
        };

        let scope = match meta.get_item("scope")? {
            Some(raw) if !raw.is_none() => {
                let raw: String = raw.extract()?;
                FixtureScope::parse(&raw).unwrap_or_else(|| {
                    warn!("fixture '{name}' declares unknown scope '{raw}', using function");
                    FixtureScope::Function
                })
            }
            _ => FixtureScope::Function,
        };

        let autouse = meta
            .get_item("autouse")?
            .map(|v| v.is_truthy())
            .transpose()?
            .unwrap_or(false);

        let params = match meta.get_item("params")? {
            Some(params) if !params.is_none() => params
                .try_iter()?
                .map(|p| p.map(Bound::unbind))
                .collect::<PyResult<Vec<_>>>()?,
            _ => Vec::new(),
        };

        let ids = match meta.get_item("ids")? {
            None => IdSource::Default,
            Some(ids) if ids.is_none() => IdSource::Default,
            Some(ids) if ids.is_callable() => IdSource::Callable(ids.unbind()),
            Some(ids) => IdSource::List(ids.extract()?),
        };

        let wants_request = probe.params.iter().any(|p| p == "request");
        let dependencies = probe
            .params
            .iter()
            .filter(|p| p.as_str() != "request")
            .cloned()
            .collect();

        Ok(Self {
            name,
            scope,
            autouse,
            is_generator: probe.is_generator || probe.is_async_generator,
            is_async: probe.is_coroutine || probe.is_async_generator,
            params,
            ids,
            dependencies,
            callable: obj.clone().unbind(),
            wants_request,
            path: path.to_path_buf(),
            from_conftest,
            line_number: probe.line,
        })
    }
}

/// Flat, scope-addressable fixture index. Lookup walks outward from a test's
/// lexical location: same file, then conftest ancestors toward the root.
#[derive(Debug, Default)]
pub struct FixtureRegistry {
    /// Module-level fixtures per test file.
    by_file: HashMap<PathBuf, Vec<Arc<FixtureDef>>>,
    /// Conftest fixtures per directory.
    by_dir: HashMap<PathBuf, Vec<Arc<FixtureDef>>>,
    root: PathBuf,
}

impl FixtureRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self {
            by_file: HashMap::new(),
            by_dir: HashMap::new(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn register_module(&mut self, file: &Path, defs: Vec<Arc<FixtureDef>>) {
        self.by_file.entry(file.to_path_buf()).or_default().extend(defs);
    }

    pub fn register_conftest(&mut self, dir: &Path, defs: Vec<Arc<FixtureDef>>) {
        self.by_dir.entry(dir.to_path_buf()).or_default().extend(defs);
    }

    /// Directories walked for a test file, innermost first, stopping at the
    /// project root.
    fn ancestor_dirs<'a>(&'a self, test_file: &'a Path) -> impl Iterator<Item = &'a Path> {
        test_file
            .ancestors()
            .skip(1)
            .take_while(move |dir| dir.starts_with(&self.root))
    }

    /// Innermost fixture matching `name`, optionally skipping one identity
    /// (a fixture overriding a same-named outer fixture depends on the outer
    /// one, not on itself).
    pub fn lookup(
        &self,
        name: &str,
        test_file: &Path,
        exclude_identity: Option<&str>,
    ) -> Option<Arc<FixtureDef>> {
        let matches = |def: &&Arc<FixtureDef>| {
            def.name == name
                && exclude_identity.is_none_or(|excluded| def.identity() != excluded)
        };

        if let Some(defs) = self.by_file.get(test_file) {
            // Later same-name definitions in one module shadow earlier ones.
            if let Some(def) = defs.iter().rev().find(matches) {
                return Some(Arc::clone(def));
            }
        }
        for dir in self.ancestor_dirs(test_file) {
            if let Some(defs) = self.by_dir.get(dir) {
                if let Some(def) = defs.iter().rev().find(matches) {
                    return Some(Arc::clone(def));
                }
            }
        }
        None
    }

    /// Autouse fixtures applying to a test file, outermost conftest first,
    /// then the file's own, in declaration order.
    pub fn autouse_for(&self, test_file: &Path) -> Vec<Arc<FixtureDef>> {
        let mut result = Vec::new();
        let dirs: Vec<&Path> = self.ancestor_dirs(test_file).collect();
        for dir in dirs.into_iter().rev() {
            if let Some(defs) = self.by_dir.get(dir) {
                result.extend(defs.iter().filter(|d| d.autouse).map(Arc::clone));
            }
        }
        if let Some(defs) = self.by_file.get(test_file) {
            result.extend(defs.iter().filter(|d| d.autouse).map(Arc::clone));
        }
        result
    }

    /// Every fixture name visible from a test file; used for
    /// missing-fixture suggestions.
    pub fn visible_names(&self, test_file: &Path) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(defs) = self.by_file.get(test_file) {
            names.extend(defs.iter().map(|d| d.name.clone()));
        }
        for dir in self.ancestor_dirs(test_file) {
            if let Some(defs) = self.by_dir.get(dir) {
                names.extend(defs.iter().map(|d| d.name.clone()));
            }
        }
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def_named(py: Python<'_>, name: &str, path: &Path, line: usize, autouse: bool) -> Arc<FixtureDef> {
        let callable = py.None();
        Arc::new(FixtureDef {
            name: name.to_string(),
            scope: FixtureScope::Function,
            autouse,
            is_generator: false,
            is_async: false,
            params: Vec::new(),
            ids: IdSource::Default,
            dependencies: Vec::new(),
            callable,
            wants_request: false,
            path: path.to_path_buf(),
            from_conftest: false,
            line_number: line,
        })
    }

    #[test]
    fn innermost_registration_wins() {
        Python::with_gil(|py| {
            let root = PathBuf::from("/proj");
            let mut registry = FixtureRegistry::new(root.clone());
            let test_file = root.join("tests/unit/test_a.py");

            registry.register_conftest(
                &root.join("tests"),
                vec![def_named(py, "db", &root.join("tests/conftest.py"), 1, false)],
            );
            registry.register_conftest(
                &root.join("tests/unit"),
                vec![def_named(py, "db", &root.join("tests/unit/conftest.py"), 1, false)],
            );

            let found = registry.lookup("db", &test_file, None).unwrap();
            assert_eq!(found.path, root.join("tests/unit/conftest.py"));
        });
    }

    #[test]
    fn same_file_beats_conftest() {
        Python::with_gil(|py| {
            let root = PathBuf::from("/proj");
            let mut registry = FixtureRegistry::new(root.clone());
            let test_file = root.join("tests/test_a.py");

            registry.register_conftest(
                &root.join("tests"),
                vec![def_named(py, "db", &root.join("tests/conftest.py"), 1, false)],
            );
            registry.register_module(
                &test_file,
                vec![def_named(py, "db", &test_file, 5, false)],
            );

            let found = registry.lookup("db", &test_file, None).unwrap();
            assert_eq!(found.path, test_file);
        });
    }

    #[test]
    fn excluded_identity_falls_through_to_outer() {
        Python::with_gil(|py| {
            let root = PathBuf::from("/proj");
            let mut registry = FixtureRegistry::new(root.clone());
            let test_file = root.join("tests/test_a.py");

            let outer = def_named(py, "db", &root.join("tests/conftest.py"), 1, false);
            let inner = def_named(py, "db", &test_file, 5, false);
            registry.register_conftest(&root.join("tests"), vec![Arc::clone(&outer)]);
            registry.register_module(&test_file, vec![Arc::clone(&inner)]);

            let found = registry
                .lookup("db", &test_file, Some(&inner.identity()))
                .unwrap();
            assert_eq!(found.identity(), outer.identity());
        });
    }

    #[test]
    fn autouse_orders_ancestor_first() {
        Python::with_gil(|py| {
            let root = PathBuf::from("/proj");
            let mut registry = FixtureRegistry::new(root.clone());
            let test_file = root.join("tests/unit/test_a.py");

            registry.register_conftest(
                &root.join("tests"),
                vec![def_named(py, "outer_auto", &root.join("tests/conftest.py"), 1, true)],
            );
            registry.register_conftest(
                &root.join("tests/unit"),
                vec![def_named(py, "inner_auto", &root.join("tests/unit/conftest.py"), 1, true)],
            );
            registry.register_module(
                &test_file,
                vec![def_named(py, "file_auto", &test_file, 3, true)],
            );

            let names: Vec<_> = registry
                .autouse_for(&test_file)
                .iter()
                .map(|d| d.name.clone())
                .collect();
            assert_eq!(names, vec!["outer_auto", "inner_auto", "file_auto"]);
        });
    }

    #[test]
    fn missing_lookup_returns_none() {
        let registry = FixtureRegistry::new(PathBuf::from("/proj"));
        assert!(registry
            .lookup("ghost", Path::new("/proj/test_a.py"), None)
            .is_none());
    }
}
