//! Deploy lifecycle adapter: records deploy progress into a [`DeployLedger`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use stackwire_state::{
    DeployLedger, DeploymentId, RunEvent, RunId, RunMetadata, RunSummary, StorageResult,
};

/// Adapter that records deploy events into a [`DeployLedger`].
///
/// Usage:
/// 1. Call [`DeployRunRecorder::start`] to create a new run.
/// 2. Call [`DeployRunRecorder::record`] for each lifecycle event.
/// 3. Call [`DeployRunRecorder::finish_ok`], [`DeployRunRecorder::finish_err`]
///    or [`DeployRunRecorder::finish_cancelled`] to finalize.
pub struct DeployRunRecorder {
    ledger: Arc<dyn DeployLedger>,
    run_id: RunId,
    seq: AtomicU64,
}

impl DeployRunRecorder {
    /// Start a new run in the ledger, returning a recorder bound to that run.
    pub async fn start(
        ledger: Arc<dyn DeployLedger>,
        deployment: &DeploymentId,
        action: &str,
    ) -> StorageResult<Self> {
        let metadata = RunMetadata {
            action: action.to_string(),
            operator: std::env::var("USER").unwrap_or_else(|_| "stackwire".to_string()),
            tags: serde_json::json!({}),
        };
        let run_id = ledger.create_run(deployment, metadata).await?;
        Ok(Self {
            ledger,
            run_id,
            seq: AtomicU64::new(0),
        })
    }

    /// Append one event with the next sequence number.
    pub async fn record(&self, kind: &str, payload: serde_json::Value) -> StorageResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(&self.run_id, event).await
    }

    /// Number of events recorded so far.
    pub fn events_recorded(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Finalize the run as completed.
    pub async fn finish_ok(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.complete_run(&self.run_id, summary).await
    }

    /// Finalize the run as failed.
    pub async fn finish_err(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.fail_run(&self.run_id, summary).await
    }

    pub async fn finish_cancelled(self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.cancel_run(&self.run_id, summary).await
    }

    /// Return a reference to the run ID.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}
