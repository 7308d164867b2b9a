//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryStateStore` and `MemoryDeployLedger` that satisfy the
//! trait contracts without touching the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory state store backed by a `HashMap<deployment, DeploymentState>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    deployments: Mutex<HashMap<String, DeploymentState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<T>(
        &self,
        deployment: &DeploymentId,
        f: impl FnOnce(&mut DeploymentState) -> T,
    ) -> StorageResult<T> {
        deployment.validate()?;
        let mut deployments = self.deployments.lock().unwrap();
        let state = deployments
            .entry(deployment.0.clone())
            .or_insert_with(|| DeploymentState::empty(deployment));
        Ok(f(state))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, deployment: &DeploymentId) -> StorageResult<DeploymentState> {
        deployment.validate()?;
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments
            .get(&deployment.0)
            .cloned()
            .unwrap_or_else(|| DeploymentState::empty(deployment)))
    }

    async fn init_token(
        &self,
        deployment: &DeploymentId,
        candidate: &str,
    ) -> StorageResult<String> {
        self.mutate(deployment, |state| {
            state
                .uniqueness_token
                .get_or_insert_with(|| candidate.to_string())
                .clone()
        })
    }

    async fn put_resource(
        &self,
        deployment: &DeploymentId,
        record: ResourceRecord,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.resources.insert(record.address.clone(), record);
        })
    }

    async fn remove_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.resources.remove(address);
        })
    }

    async fn get_custom_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<Option<CustomResourceRecord>> {
        deployment.validate()?;
        let deployments = self.deployments.lock().unwrap();
        Ok(deployments
            .get(&deployment.0)
            .and_then(|s| s.custom_resources.get(address))
            .cloned())
    }

    async fn put_custom_resource(
        &self,
        deployment: &DeploymentId,
        record: CustomResourceRecord,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state
                .custom_resources
                .insert(record.address.clone(), record);
        })
    }

    async fn remove_custom_resource(
        &self,
        deployment: &DeploymentId,
        address: &str,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.custom_resources.remove(address);
        })
    }

    async fn publish_outputs(
        &self,
        deployment: &DeploymentId,
        group: &str,
        outputs: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.outputs.insert(group.to_string(), outputs);
        })
    }

    async fn retract_outputs(&self, deployment: &DeploymentId, group: &str) -> StorageResult<()> {
        self.mutate(deployment, |state| {
            state.outputs.remove(group);
        })
    }

    async fn list_deployments(&self) -> StorageResult<Vec<DeploymentId>> {
        let deployments = self.deployments.lock().unwrap();
        let mut ids: Vec<DeploymentId> = deployments.keys().cloned().map(DeploymentId).collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// MemoryDeployLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory deploy ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryDeployLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryDeployLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish(&self, run_id: &RunId, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl DeployLedger for MemoryDeployLedger {
    async fn create_run(
        &self,
        deployment: &DeploymentId,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            deployment_id: deployment.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        if let Some(last) = state.events.last() {
            if event.seq <= last.seq {
                return Err(StorageError::OutOfOrderEvent {
                    run_id: run_id.0.clone(),
                    seq: event.seq,
                    last: last.seq,
                });
            }
        }
        state.events.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary)
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Cancelled, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.events.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, deployment: Option<&DeploymentId>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| deployment.map_or(true, |d| &s.record.deployment_id == d))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
