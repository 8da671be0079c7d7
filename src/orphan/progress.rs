//! Progress reporting for long-running sweeps.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    Running,
    Completed,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressState::Running => write!(f, "running"),
            ProgressState::Completed => write!(f, "completed"),
        }
    }
}

/// One step of a sweep: `done` out of `total` for the work named by `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub message: String,
    pub total: usize,
    pub done: usize,
    pub state: ProgressState,
}

impl ProgressReport {
    pub fn running(message: impl Into<String>, total: usize) -> Self {
        Self {
            message: message.into(),
            total,
            done: 0,
            state: ProgressState::Running,
        }
    }

    pub fn increment(&mut self) {
        self.done = (self.done + 1).min(self.total);
    }

    pub fn complete(&mut self) {
        self.done = self.total;
        self.state = ProgressState::Completed;
    }
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &ProgressReport);
}

/// Sends progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, progress: &ProgressReport) {
        tracing::info!(
            message = %progress.message,
            done = progress.done,
            total = progress.total,
            state = %progress.state,
            "progress"
        );
    }
}

/// Keeps every report, for inspection.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    reports: Mutex<Vec<ProgressReport>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ProgressReport> {
        self.reports.lock().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, progress: &ProgressReport) {
        self.reports.lock().push(progress.clone());
    }
}
