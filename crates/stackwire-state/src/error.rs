//! Error types for stackwire-state

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Deployment ids double as file names, so they are restricted
    #[error("invalid deployment id: {id}")]
    InvalidDeploymentId { id: String },

    /// Run not found in the ledger
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state the operation requires
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Event sequence numbers must increase within a run
    #[error("out-of-order event for run {run_id}: seq {seq} after {last}")]
    OutOfOrderEvent { run_id: String, seq: u64, last: u64 },

    /// Digest string is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
