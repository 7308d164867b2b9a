//! Storage trait definitions for stackwire
//!
//! Two seams sit between the deploy engine and persistence:
//! - `StateStore`: per-deployment records (resources, custom resources, outputs)
//! - `DeployLedger`: deploy run persistence (events, summaries)
//!
//! Both are async. `FileStateStore` persists state on disk; the `fakes`
//! module keeps everything in memory for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// Used to compare last-applied resource properties without storing them
/// verbatim. The inner field is private so the string is always valid
/// lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// SHA-256 over a canonical property encoding.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 12 hex chars, for plan output.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StateStore: per-deployment records
// ---------------------------------------------------------------------------

/// Identifier of one deployment (one instantiation of a definition).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    pub fn new(id: impl Into<String>) -> Self {
        DeploymentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids are used as file names by [`crate::FileStateStore`].
    pub fn validate(&self) -> StorageResult<()> {
        let ok = !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if ok {
            Ok(())
        } else {
            Err(StorageError::InvalidDeploymentId { id: self.0.clone() })
        }
    }
}

impl std::fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Disposition of a resource's external state when it leaves the definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
    Snapshot,
}

impl std::fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemovalPolicy::Destroy => "destroy",
            RemovalPolicy::Retain => "retain",
            RemovalPolicy::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

/// A resource materialized through the provisioning backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// `group/logical_id`
    pub address: String,
    pub group: String,
    /// Resource kind label
    pub kind: String,
    /// Backend-assigned identifier
    pub backend_id: String,
    /// Runtime attributes reported by the backend
    pub attributes: BTreeMap<String, String>,
    /// Digest of the last-applied resolved properties
    pub properties_digest: ContentDigest,
    /// Addresses this resource depended on when it was applied
    pub depends_on: Vec<String>,
    pub removal_policy: RemovalPolicy,
    /// Resources this one replaced whose delete has not succeeded yet
    #[serde(default)]
    pub pending_deletes: Vec<PendingDelete>,
    pub updated_at: DateTime<Utc>,
}

/// A backend resource left over from a kind-changing replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelete {
    pub backend_id: String,
    /// Kind label of the replaced resource
    pub kind: String,
}

/// A custom resource driven through an external callback handler.
///
/// Presence of a record means the resource is `Created`: the physical id
/// is only written after a successful CREATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResourceRecord {
    /// `group/logical_id`
    pub address: String,
    pub group: String,
    /// Resolved handler reference (e.g. a function ARN)
    pub handler_ref: String,
    pub physical_id: String,
    /// Last-applied resolved properties
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Data returned by the handler on the last successful transition
    pub data: BTreeMap<String, String>,
    pub removal_policy: RemovalPolicy,
    pub depends_on: Vec<String>,
    /// Replaced physical ids whose DELETE has not succeeded yet
    #[serde(default)]
    pub pending_deletes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Everything persisted for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub deployment_id: String,
    /// Generated once on first deploy, reused for every later name derivation
    pub uniqueness_token: Option<String>,
    pub resources: BTreeMap<String, ResourceRecord>,
    pub custom_resources: BTreeMap<String, CustomResourceRecord>,
    /// `group -> output name -> value`, snapshots taken when a group settles
    pub outputs: BTreeMap<String, BTreeMap<String, String>>,
}

impl DeploymentState {
    pub fn empty(deployment: &DeploymentId) -> Self {
        Self {
            deployment_id: deployment.0.clone(),
            ..Default::default()
        }
    }

    /// `true` when nothing is recorded for the deployment.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.custom_resources.is_empty() && self.outputs.is_empty()
    }
}

/// Deployment state store.
///
/// Guarantees:
/// - `load` of an unknown deployment returns an empty state, not an error.
/// - Every mutation is durable once the call returns.
/// - `init_token` is get-or-set: the first token written wins.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the full state of a deployment.
    async fn load(&self, deployment: &DeploymentId) -> StorageResult<DeploymentState>;

    /// Persist `candidate` as the uniqueness token unless one exists; return
    /// the token in effect.
    async fn init_token(&self, deployment: &DeploymentId, candidate: &str)
        -> StorageResult<String>;

    /// Insert or replace a resource record.
    async fn put_resource(
        &self,
        deployment: &DeploymentId,
        record: ResourceRecord,
    ) -> StorageResult<()>;

    /// Remove a resource record. No-op if absent.
    async fn remove_resource(&self, deployment: &DeploymentId, address: &str)
        -> StorageResult<()>;

    /// Fetch a single custom resource record.
    async fn get_custom_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<Option<CustomResourceRecord>>;

    /// Insert or replace a custom resource record.
    async fn put_custom_resource(
        &self,
        deployment: &DeploymentId,
        record: CustomResourceRecord,
    ) -> StorageResult<()>;

    /// Remove a custom resource record. No-op if absent.
    async fn remove_custom_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<()>;

    /// Replace the published outputs of a group.
    async fn publish_outputs(
        &self,
        deployment: &DeploymentId,
        group: &str,
        outputs: BTreeMap<String, String>,
    ) -> StorageResult<()>;

    /// Drop the published outputs of a group. No-op if absent.
    async fn retract_outputs(&self, deployment: &DeploymentId, group: &str) -> StorageResult<()>;

    /// List every deployment with persisted state.
    async fn list_deployments(&self) -> StorageResult<Vec<DeploymentId>>;
}

// ---------------------------------------------------------------------------
// DeployLedger: deploy run persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a deploy run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Fresh v4 identifier.
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who started a run and why
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// "deploy" or "destroy"
    pub action: String,
    /// Who or what started the run
    pub operator: String,
    pub tags: serde_json::Value,
}

/// A single event in a deploy run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Strictly increasing within one run
    pub seq: u64,
    /// Event kind (e.g. "resource_settled", "resource_failed")
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_events: u64,
    /// Resources that reached a settled state during the run
    pub settled: u64,
    pub failed: u64,
    pub duration_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A run as the ledger stores it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub deployment_id: DeploymentId,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Deploy run ledger.
///
/// Events come back in `seq` order. A run starts `Running` and ends in
/// exactly one terminal status, after which it accepts no more events.
#[async_trait]
pub trait DeployLedger: Send + Sync {
    /// Open a run for `deployment`.
    async fn create_run(
        &self,
        deployment: &DeploymentId,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Close a run that settled every node.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Close a run with at least one failed node.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Close a run stopped between levels.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Events for a run in `seq` order.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs, optionally filtered by deployment.
    async fn list_runs(&self, deployment: Option<&DeploymentId>) -> StorageResult<Vec<RunRecord>>;
}
