#![forbid(unsafe_code)]

//! Progress events pushed out of the download pipeline.
//!
//! The pipeline only talks to [`ProgressObserver`]; how progress is shown is
//! up to the implementation. Observers are called from blocking download
//! threads at a high rate, so none of them may block.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::persist::write_atomic;

pub trait ProgressObserver: Send + Sync {
    /// Fraction of the current transfer, clamped to `[0, 1]` by callers.
    fn on_progress(&self, fraction: f64);
    fn on_status(&self, label: &str);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _fraction: f64) {}
    fn on_status(&self, _label: &str) {}
}

/// Emits status changes and every tenth of progress through `tracing`.
#[derive(Debug, Default)]
pub struct LogObserver {
    last_decile: AtomicU8,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for LogObserver {
    fn on_progress(&self, fraction: f64) {
        let decile = (fraction.clamp(0.0, 1.0) * 10.0).floor() as u8;
        let previous = self.last_decile.swap(decile, Ordering::Relaxed);
        if decile != previous {
            tracing::trace!(percent = u32::from(decile) * 10, "download progress");
        }
    }

    fn on_status(&self, label: &str) {
        self.last_decile.store(0, Ordering::Relaxed);
        tracing::debug!("{label}");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressReport<'a> {
    progress: u8,
    message: &'a str,
}

#[derive(Default)]
struct FileState {
    message: String,
    percent: u8,
    last_write: Option<Instant>,
    /// Bumped for every snapshot handed to the writer.
    generation: u64,
}

/// Mirrors the latest status into a small JSON file (`{"progress", "message"}`)
/// that other processes can poll. Writes go through a temp file and a rename
/// and happen outside the state lock; a snapshot older than the one already
/// on disk is dropped.
pub struct ProgressFile {
    path: PathBuf,
    min_interval: Duration,
    state: Mutex<FileState>,
    /// Generation of the last snapshot written.
    written: Mutex<u64>,
}

impl ProgressFile {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_interval(path, Self::DEFAULT_INTERVAL)
    }

    pub fn with_interval(path: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self {
            path: path.into(),
            min_interval,
            state: Mutex::new(FileState::default()),
            written: Mutex::new(0),
        }
    }

    fn snapshot(state: &mut FileState) -> Option<(u64, Vec<u8>)> {
        let report = ProgressReport {
            progress: state.percent.min(100),
            message: &state.message,
        };
        state.last_write = Some(Instant::now());
        match serde_json::to_vec(&report) {
            Ok(payload) => {
                state.generation += 1;
                Some((state.generation, payload))
            }
            Err(err) => {
                tracing::warn!("could not serialize progress report: {err}");
                None
            }
        }
    }

    /// Writes `payload` unless a newer snapshot is already on disk. With
    /// `wait` unset a busy writer means the snapshot is skipped.
    fn write(&self, generation: u64, payload: &[u8], wait: bool) {
        let written = if wait {
            Some(self.written.lock())
        } else {
            self.written.try_lock()
        };
        let Some(mut written) = written else {
            return;
        };
        if *written >= generation {
            return;
        }
        match write_atomic(&self.path, payload) {
            Ok(()) => *written = generation,
            Err(err) => tracing::warn!(path = %self.path.display(), "could not write progress file: {err:#}"),
        }
    }
}

impl ProgressObserver for ProgressFile {
    fn on_progress(&self, fraction: f64) {
        let snapshot = {
            // Skip the update rather than wait behind another caller.
            let Some(mut state) = self.state.try_lock() else {
                return;
            };
            state.percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
            let due = state
                .last_write
                .is_none_or(|last| last.elapsed() >= self.min_interval);
            let finished = state.percent == 100;
            if !due && !finished {
                return;
            }
            Self::snapshot(&mut state).map(|(generation, payload)| (generation, payload, finished))
        };
        if let Some((generation, payload, finished)) = snapshot {
            self.write(generation, &payload, finished);
        }
    }

    fn on_status(&self, label: &str) {
        let snapshot = {
            let mut state = self.state.lock();
            state.message = label.to_string();
            state.percent = 0;
            Self::snapshot(&mut state)
        };
        if let Some((generation, payload)) = snapshot {
            self.write(generation, &payload, true);
        }
    }
}
