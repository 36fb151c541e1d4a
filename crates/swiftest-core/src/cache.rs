//! Persisted last-failed cache.
//!
//! A single JSON file mapping test item ids to their most recent
//! failed/errored outcome, used to filter (`--lf`) or reorder (`--ff`)
//! subsequent plans. The cache is advisory: a missing or unreadable file
//! degrades to "run everything in discovery order" without error.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::events::Outcome;

const CACHE_FILE: &str = "lastfailed";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LastFailedCache {
    entries: HashMap<String, Outcome>,
    /// Whether a readable cache file backed this value. A persisted cache
    /// with zero failures means "everything was green", which is different
    /// from having no record at all.
    #[serde(skip)]
    persisted: bool,
}

impl LastFailedCache {
    fn file_path(dir: &Path) -> PathBuf {
        dir.join(CACHE_FILE)
    }

    /// Load the cache from `dir`. Missing or corrupt files yield an empty,
    /// unpersisted cache.
    pub fn load(dir: &Path) -> Self {
        let path = Self::file_path(dir);
        let Ok(file) = File::open(&path) else {
            return Self::default();
        };
        match serde_json::from_reader::<_, Self>(BufReader::new(file)) {
            Ok(mut cache) => {
                cache.persisted = true;
                cache
            }
            Err(err) => {
                debug!("discarding unreadable cache at {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Atomically rewrite the cache in `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::file_path(dir);
        let temp_path = path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            serde_json::to_writer(BufWriter::new(file), self)?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    /// Fold one run's outcomes in: failures are remembered, anything else
    /// clears a previously remembered failure.
    pub fn record_run<'a>(&mut self, outcomes: impl IntoIterator<Item = (&'a str, Outcome)>) {
        for (id, outcome) in outcomes {
            if outcome.is_failure() {
                self.entries.insert(id.to_string(), outcome);
            } else {
                self.entries.remove(id);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// True when a readable cache file existed on disk.
    pub fn persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
