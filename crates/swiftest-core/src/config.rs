//! Runner configuration consumed by the core.
//!
//! The CLI (or any other frontend) is responsible for producing a `Config`;
//! the core never parses configuration files itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the dot-directory holding the persisted cache, relative to the
/// project root.
pub const DEFAULT_CACHE_DIR: &str = ".swiftest_cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Extra source roots prepended to the interpreter's import search path.
    pub pythonpath: Vec<PathBuf>,
    /// Stop issuing plan steps after the first failed/errored outcome.
    pub fail_fast: bool,
    /// Run only the items that failed or errored in the previous run.
    pub last_failed: bool,
    /// Run previously failed items first, then the rest in discovery order.
    pub failed_first: bool,
    /// Redirect stdout/stderr into per-item buffers.
    pub capture_output: bool,
    /// Substring filter against test item ids.
    pub pattern: Option<String>,
    /// Renderer hint carried on the event stream; the core never interprets it.
    pub ascii_mode: bool,
    /// Cache location override. Defaults to `.swiftest_cache` under the
    /// project root.
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pythonpath: Vec::new(),
            fail_fast: false,
            last_failed: false,
            failed_first: false,
            capture_output: true,
            pattern: None,
            ascii_mode: false,
            cache_dir: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.last_failed && self.failed_first {
            return Err(Error::Config(
                "--lf and --ff are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the cache directory against a project root.
    pub fn cache_dir_for(&self, project_root: &Path) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| project_root.join(DEFAULT_CACHE_DIR))
    }
}
