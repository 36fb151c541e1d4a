//! The structured event stream emitted by the core.
//!
//! Events are produced strictly in plan order; the renderer (outside the
//! core) decides how they look on a terminal.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;

/// Final classification of one test item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    Xfailed,
    Xpassed,
    Errored,
}

impl Outcome {
    /// True for the outcomes that make a run red.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Xfailed => "xfailed",
            Self::Xpassed => "xpassed",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub xfailed: usize,
    pub xpassed: usize,
    pub errored: usize,
    pub duration: Duration,
}

impl Summary {
    pub fn record(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Xfailed => self.xfailed += 1,
            Outcome::Xpassed => self.xpassed += 1,
            Outcome::Errored => self.errored += 1,
        }
    }

    /// `0` iff no item ended failed or errored.
    pub fn exit_code(&self) -> u8 {
        if self.failed == 0 && self.errored == 0 {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    RunStarted {
        total_items: usize,
        ascii_mode: bool,
    },
    TestStarted {
        id: String,
        path: PathBuf,
    },
    TestEnded {
        id: String,
        outcome: Outcome,
        duration: Duration,
        captured_stdout: String,
        captured_stderr: String,
        diagnostic: Option<Diagnostic>,
    },
    /// Non-fatal trouble: finalizer failures, loop teardown errors.
    Warning {
        message: String,
    },
    RunEnded {
        summary: Summary,
    },
}

/// Consumer seam for the event stream.
pub trait EventSink {
    fn emit(&self, event: Event);
}

/// Sends events across a channel to a renderer thread. A disconnected
/// receiver silently drops events; the run itself never depends on the
/// renderer being alive.
pub struct ChannelSink {
    tx: Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// Buffers events in memory; used by tests to assert on stream contents
/// and ordering.
#[derive(Default)]
pub struct BufferSink {
    events: Mutex<Vec<Event>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

impl EventSink for BufferSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}
