use thiserror::Error;

use super::protocol::RequestType;

/// A lifecycle transition that did not complete. The resource stays in its
/// last settled state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("{request_type} of {address} failed: {reason}")]
    HandlerFailed {
        address: String,
        request_type: RequestType,
        reason: String,
    },

    #[error("{request_type} of {address} timed out after {limit_ms}ms")]
    Timeout {
        address: String,
        request_type: RequestType,
        limit_ms: u64,
    },

    #[error("{request_type} of {address}: handler unreachable: {reason}")]
    Transport {
        address: String,
        request_type: RequestType,
        reason: String,
    },

    #[error("CREATE of {address} succeeded without a physical id")]
    MissingPhysicalId { address: String },

    #[error("{address} is busy; lease not acquired within {waited_ms}ms")]
    LeaseTimeout { address: String, waited_ms: u64 },

    #[error("invalid invocation for {address}: {reason}")]
    InvalidInvocation { address: String, reason: String },
}

/// The replacement resource exists and is recorded, but deleting the one
/// it replaced failed. The old id is kept for a later DELETE attempt.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "{address} replaced by {new_physical_id}, but deleting {old_physical_id} failed: {reason}"
)]
pub struct ReplacementError {
    pub address: String,
    pub new_physical_id: String,
    pub old_physical_id: String,
    pub reason: String,
}
