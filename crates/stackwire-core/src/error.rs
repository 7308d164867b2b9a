//! Top-level error type for deploy operations.

use stackwire_state::StorageError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::custom_resource::{ReplacementError, TransitionError};
use crate::graph::PlanError;
use crate::naming::NamingError;
use crate::wiring::WiringError;

/// Errors surfaced by planning, provisioning and teardown.
#[derive(Error, Debug)]
pub enum DeployError {
    /// The definition cannot be turned into a valid plan
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// A custom-resource lifecycle transition failed
    #[error("custom resource transition failed: {0}")]
    Transition(#[from] TransitionError),

    /// The new resource exists but the one it replaced could not be deleted
    #[error("replacement incomplete: {0}")]
    Replacement(#[from] ReplacementError),

    /// Event wiring or invoke-grant failure
    #[error("wiring error: {0}")]
    Wiring(#[from] WiringError),

    /// Provisioning backend rejected an operation on a resource
    #[error("backend error for {address}: {source}")]
    Backend {
        address: String,
        #[source]
        source: BackendError,
    },

    #[error("naming error: {0}")]
    Naming(#[from] NamingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The deploy was cancelled before this work ran
    #[error("deploy cancelled")]
    Cancelled,
}

/// Result alias for deploy operations
pub type DeployResult<T> = std::result::Result<T, DeployError>;
