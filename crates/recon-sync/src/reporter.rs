//! Progress and summary for one bulk run.

use recon_core::SyncOutcome;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub current_record_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub record_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records never attempted because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
    pub failures: Vec<FailureEntry>,
}

impl RunSummary {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a SyncOutcome>) -> Self {
        outcomes
            .into_iter()
            .fold(Self::default(), |mut summary, outcome| {
                summary.record(outcome);
                summary
            })
    }

    fn record(&mut self, outcome: &SyncOutcome) {
        self.total += 1;
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
            self.failures.push(FailureEntry {
                record_id: outcome.record_id.clone(),
                error: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
    }
}

/// Folds outcomes into a summary while publishing progress to subscribers.
#[derive(Debug)]
pub struct RunReporter {
    progress: watch::Sender<SyncProgress>,
    summary: RunSummary,
}

impl Default for RunReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReporter {
    pub fn new() -> Self {
        let (progress, _rx) = watch::channel(SyncProgress::default());
        Self {
            progress,
            summary: RunSummary::default(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// Start a run over `total` records, discarding any previous run.
    pub fn begin(&mut self, total: usize) {
        self.summary = RunSummary::default();
        self.progress.send_replace(SyncProgress {
            current: 0,
            total,
            current_record_label: String::new(),
        });
    }

    pub fn record(&mut self, outcome: &SyncOutcome, record_label: &str) {
        self.summary.record(outcome);
        self.progress.send_modify(|p| {
            p.current += 1;
            p.current_record_label = record_label.to_string();
        });
    }

    pub fn finish(&mut self, cancelled: bool) -> RunSummary {
        let mut summary = std::mem::take(&mut self.summary);
        let total = self.progress.borrow().total;
        summary.skipped = total.saturating_sub(summary.total);
        summary.total = total;
        summary.cancelled = cancelled;
        summary
    }
}
