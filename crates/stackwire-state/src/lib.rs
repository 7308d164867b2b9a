//! stackwire-state: deployment state persistence
//!
//! This crate is the persistence layer for stackwire deployments. It keeps
//! everything a later deploy needs to decide between create, update and
//! delete: backend ids and attributes of provisioned resources, physical ids
//! of custom resources, published group outputs and the per-deployment
//! uniqueness token.
//!
//! ## Key Components
//!
//! - `StateStore`: per-deployment resource / custom-resource / output records
//! - `DeployLedger`: append-only record of deploy runs and their events
//! - `fakes`: in-memory implementations for tests
//! - `FileStateStore`: JSON-file backed store used by the CLI

mod error;
pub mod fakes;
pub mod file_store;
pub mod storage_traits;

pub use error::StorageError;
pub use file_store::FileStateStore;
pub use storage_traits::{
    ContentDigest, CustomResourceRecord, DeployLedger, DeploymentId, DeploymentState,
    PendingDelete, RemovalPolicy, ResourceRecord, RunEvent, RunId, RunMetadata, RunRecord, RunStatus,
    RunSummary, StateStore, StorageResult,
};
