//! Plan executor.
//!
//! Runs a [`DeployPlan`] level by level: every step in a level has all of
//! its dependencies settled, so steps within a level are dispatched
//! concurrently (bounded by `max_concurrent`). A failed step blocks all of
//! its transitive dependents; unrelated branches keep going. Group outputs
//! are published as soon as every member of the group has settled.
//!
//! After a clean run, resources recorded in state but absent from the plan
//! are torn down dependents-first, honouring removal policies.
//!
//! Only one deploy or destroy runs at a time per [`Deployment`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use stackwire_state::{
    ContentDigest, CustomResourceRecord, DeployLedger, DeploymentId, DeploymentState,
    PendingDelete, RemovalPolicy, ResourceRecord, RunId, RunSummary, StateStore,
};
use tracing::{info, instrument, warn};

use crate::backend::{BackendError, ProvisioningBackend};
use crate::config::DeployConfig;
use crate::custom_resource::{
    CustomResourceInvocation, LifecycleController, ReplacementError, TransitionOutcome,
};
use crate::error::{DeployError, DeployResult};
use crate::graph::{
    output_string, DeployPlan, PlanError, PlanStep, ResolutionScope, ResolvedProperties,
    ResourceKind,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::recording::DeployRunRecorder;
use crate::retry::{retry_transient, RetryPolicy};
use crate::wiring::WiringError;

/// Shared flag that asks a running deploy to stop after the current level.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Created,
    Updated,
    Unchanged,
    Replaced,
    Deleted,
    Retained,
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            NodeAction::Created => "created",
            NodeAction::Updated => "updated",
            NodeAction::Unchanged => "unchanged",
            NodeAction::Replaced => "replaced",
            NodeAction::Deleted => "deleted",
            NodeAction::Retained => "retained",
        })
    }
}

#[derive(Debug)]
pub struct NodeFailure {
    pub address: String,
    pub error: DeployError,
}

/// What a deploy or destroy did.
#[derive(Debug)]
pub struct DeployReport {
    pub run_id: RunId,
    /// Steps that reached a settled state, in completion order
    pub settled: Vec<(String, NodeAction)>,
    pub failed: Vec<NodeFailure>,
    /// Steps never attempted because a dependency failed or the run was cancelled
    pub skipped: Vec<String>,
    /// Stale resources torn down (or forgotten, per removal policy)
    pub removed: Vec<(String, NodeAction)>,
    /// Outputs published during this run, by group
    pub outputs: BTreeMap<String, BTreeMap<String, String>>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl DeployReport {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            settled: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            removed: Vec::new(),
            outputs: BTreeMap::new(),
            warnings: Vec::new(),
            cancelled: false,
        }
    }

    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub fn action_for(&self, address: &str) -> Option<NodeAction> {
        self.settled
            .iter()
            .chain(self.removed.iter())
            .find(|(a, _)| a == address)
            .map(|(_, action)| *action)
    }

    pub fn failure_for(&self, address: &str) -> Option<&DeployError> {
        self.failed
            .iter()
            .find(|f| f.address == address)
            .map(|f| &f.error)
    }

    pub fn output(&self, group: &str, name: &str) -> Option<&str> {
        self.outputs
            .get(group)
            .and_then(|o| o.get(name))
            .map(String::as_str)
    }

    fn summary(&self, total_events: u64, duration_ms: u64) -> RunSummary {
        RunSummary {
            total_events,
            settled: (self.settled.len() + self.removed.len()) as u64,
            failed: self.failed.len() as u64,
            duration_ms,
            success: self.success(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&DeployConfig::default())
    }
}

impl From<&DeployConfig> for ExecutorConfig {
    fn from(config: &DeployConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            retry: config.retry_policy(),
        }
    }
}

struct Settled {
    action: NodeAction,
    attributes: BTreeMap<String, String>,
}

/// A recorded resource that is being torn down.
enum Stale {
    Resource(ResourceRecord),
    Custom(CustomResourceRecord),
}

impl Stale {
    fn depends_on(&self) -> &[String] {
        match self {
            Stale::Resource(r) => &r.depends_on,
            Stale::Custom(r) => &r.depends_on,
        }
    }
}

/// Executes plans for one deployment.
pub struct Deployment {
    id: DeploymentId,
    backend: Arc<dyn ProvisioningBackend>,
    controller: Arc<LifecycleController>,
    store: Arc<dyn StateStore>,
    ledger: Arc<dyn DeployLedger>,
    config: ExecutorConfig,
    cancel: CancelHandle,
    /// Held for the whole of a deploy or destroy
    run_lock: tokio::sync::Mutex<()>,
}

impl Deployment {
    pub fn new(
        id: DeploymentId,
        backend: Arc<dyn ProvisioningBackend>,
        controller: Arc<LifecycleController>,
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn DeployLedger>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            id,
            backend,
            controller,
            store,
            ledger,
            config,
            cancel: CancelHandle::default(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &DeploymentId {
        &self.id
    }

    /// Handle that cancels this deployment's runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Bring the deployment in line with `plan`.
    ///
    /// Returns `Err` only when state or the ledger cannot be read or
    /// written; resource failures are collected in the report.
    #[instrument(skip_all, fields(deployment = %self.id, steps = plan.steps.len()))]
    pub async fn deploy(&self, plan: &DeployPlan) -> DeployResult<DeployReport> {
        let _run = self.run_lock.lock().await;
        let started = Instant::now();
        let recorder = DeployRunRecorder::start(self.ledger.clone(), &self.id, "deploy").await?;
        let mut report = DeployReport::new(recorder.run_id().clone());
        obs::emit_deploy_started(self.id.as_str(), &report.run_id.0, plan.steps.len());

        let prior = self.store.load(&self.id).await?;
        report.warnings.extend(plan.warnings.iter().map(|w| w.to_string()));

        let mut attributes: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        let mut published: BTreeSet<String> = BTreeSet::new();
        let mut failed_groups: BTreeSet<String> = BTreeSet::new();

        for level in plan.levels() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
            }
            let mut jobs = Vec::new();
            for step in level {
                if report.cancelled {
                    obs::emit_resource_skipped(&step.address, "cancelled");
                    report.skipped.push(step.address.clone());
                    continue;
                }
                if blocked.contains(&step.address) {
                    obs::emit_resource_skipped(&step.address, "dependency failed");
                    recorder
                        .record("resource_skipped", json!({ "address": step.address }))
                        .await?;
                    report.skipped.push(step.address.clone());
                    continue;
                }
                let scope = ResolutionScope {
                    origin: &step.address,
                    group: &step.group,
                    params: &plan.params,
                    attributes: &attributes,
                    outputs: &report.outputs,
                };
                match scope.resolve_properties(&step.resource.properties) {
                    Ok(properties) => jobs.push((step, properties)),
                    Err(err) => {
                        self.fail_step(plan, step, err.into(), &recorder, &mut report, &mut blocked)
                            .await?;
                    }
                }
            }

            let prior_ref = &prior;
            let mut results: Vec<(&PlanStep, DeployResult<Settled>)> = stream::iter(jobs)
                .map(|(step, properties)| async move {
                    let previous = prior_ref.resources.get(&step.address);
                    (step, self.apply_step(step, properties, previous).await)
                })
                .buffer_unordered(self.config.max_concurrent)
                .collect()
                .await;
            results.sort_by_key(|(step, _)| step.position);

            for (step, result) in results {
                match result {
                    Ok(settled) => {
                        obs::emit_resource_settled(&step.address, &settled.action.to_string());
                        recorder
                            .record(
                                "resource_settled",
                                json!({ "address": step.address, "action": settled.action }),
                            )
                            .await?;
                        attributes.insert(step.address.clone(), settled.attributes);
                        report.settled.push((step.address.clone(), settled.action));
                    }
                    Err(err) => {
                        self.fail_step(plan, step, err, &recorder, &mut report, &mut blocked)
                            .await?;
                    }
                }
            }

            self.publish_ready_groups(
                plan,
                &attributes,
                &mut published,
                &mut failed_groups,
                &recorder,
                &mut report,
            )
            .await?;
        }

        if !report.cancelled {
            let stale = stale_records(plan, prior);
            if report.failed.is_empty() {
                self.teardown(stale.records, &recorder, &mut report).await?;
                for group in stale.groups {
                    self.store.retract_outputs(&self.id, &group).await?;
                    info!(group = %group, "outputs retracted");
                }
            } else if !stale.records.is_empty() {
                let message = format!(
                    "teardown of {} stale resource(s) deferred until the deploy succeeds",
                    stale.records.len()
                );
                warn!("{message}");
                report.warnings.push(message);
            }
        }

        self.finish(recorder, &report, started).await;
        Ok(report)
    }

    /// Tear down everything recorded for the deployment.
    #[instrument(skip_all, fields(deployment = %self.id))]
    pub async fn destroy(&self) -> DeployResult<DeployReport> {
        let _run = self.run_lock.lock().await;
        let started = Instant::now();
        let recorder = DeployRunRecorder::start(self.ledger.clone(), &self.id, "destroy").await?;
        let mut report = DeployReport::new(recorder.run_id().clone());
        let state = self.store.load(&self.id).await?;
        obs::emit_deploy_started(
            self.id.as_str(),
            &report.run_id.0,
            state.resources.len() + state.custom_resources.len(),
        );

        let groups: Vec<String> = state.outputs.keys().cloned().collect();
        let mut records = BTreeMap::new();
        for (address, record) in state.resources {
            records.insert(address, Stale::Resource(record));
        }
        for (address, record) in state.custom_resources {
            records.insert(address, Stale::Custom(record));
        }
        self.teardown(records, &recorder, &mut report).await?;

        if report.success() {
            for group in groups {
                self.store.retract_outputs(&self.id, &group).await?;
            }
        }
        self.finish(recorder, &report, started).await;
        Ok(report)
    }

    async fn apply_step(
        &self,
        step: &PlanStep,
        properties: ResolvedProperties,
        previous: Option<&ResourceRecord>,
    ) -> DeployResult<Settled> {
        match step.resource.kind {
            ResourceKind::CustomResource => self.apply_custom(step, properties).await,
            ResourceKind::Permission => match self.apply_backend(step, properties, previous).await {
                Err(DeployError::Backend { address, source }) => Err(WiringError::GrantFailed {
                    address,
                    reason: source.to_string(),
                }
                .into()),
                other => other,
            },
            _ => self.apply_backend(step, properties, previous).await,
        }
    }

    async fn apply_custom(
        &self,
        step: &PlanStep,
        properties: ResolvedProperties,
    ) -> DeployResult<Settled> {
        let invocation = CustomResourceInvocation::from_resolved(
            &step.address,
            &step.group,
            &step.resource.id,
            properties,
            step.resource.removal_policy,
            step.depends_on.clone(),
        )?;
        let outcome = self.controller.apply(&invocation).await?;
        let action = match &outcome {
            TransitionOutcome::Created { .. } => NodeAction::Created,
            TransitionOutcome::Updated { .. } => NodeAction::Updated,
            TransitionOutcome::Replaced { .. } => NodeAction::Replaced,
            _ => NodeAction::Unchanged,
        };
        let mut attributes = outcome.data().cloned().unwrap_or_default();
        if let Some(physical_id) = outcome.physical_id() {
            attributes.insert("PhysicalId".to_string(), physical_id.to_string());
            attributes.insert("Ref".to_string(), physical_id.to_string());
        }
        Ok(Settled { action, attributes })
    }

    async fn apply_backend(
        &self,
        step: &PlanStep,
        properties: ResolvedProperties,
        previous: Option<&ResourceRecord>,
    ) -> DeployResult<Settled> {
        let kind = &step.resource.kind;
        let digest = ContentDigest::from_bytes(&serde_json::to_vec(&properties)?);
        let backend_err = |source: BackendError| DeployError::Backend {
            address: step.address.clone(),
            source,
        };
        let retry = &self.config.retry;

        let previous = match previous {
            Some(record) if !record.pending_deletes.is_empty() => {
                Some(self.retry_pending_deletes(&step.address, record.clone()).await?)
            }
            other => other.cloned(),
        };

        let (action, backend_id, attributes) = match previous.as_ref() {
            Some(record) if record.kind == kind.as_str() && record.properties_digest == digest => {
                if record.depends_on == step.depends_on
                    && record.removal_policy == step.resource.removal_policy
                {
                    return Ok(Settled {
                        action: NodeAction::Unchanged,
                        attributes: record.attributes.clone(),
                    });
                }
                (
                    NodeAction::Unchanged,
                    record.backend_id.clone(),
                    record.attributes.clone(),
                )
            }
            Some(record) if record.kind == kind.as_str() => {
                let attributes = retry_transient(retry, &step.address, || {
                    self.backend
                        .update_resource(&record.backend_id, kind, &properties)
                })
                .await
                .map_err(backend_err)?;
                METRICS.inc_updated();
                (NodeAction::Updated, record.backend_id.clone(), attributes)
            }
            Some(record) => {
                // Kind changed: the new resource is recorded before the old one is deleted.
                let created = retry_transient(retry, &step.address, || {
                    self.backend.create_resource(kind, &properties)
                })
                .await
                .map_err(backend_err)?;
                METRICS.inc_created();
                let mut replaced =
                    resource_record(step, &created.id, &created.attributes, digest.clone());
                replaced.pending_deletes.push(PendingDelete {
                    backend_id: record.backend_id.clone(),
                    kind: record.kind.clone(),
                });
                self.store.put_resource(&self.id, replaced).await?;
                let old_kind = ResourceKind::from_label(&record.kind);
                retry_transient(retry, &step.address, || {
                    self.backend.delete_resource(&record.backend_id, &old_kind)
                })
                .await
                .map_err(|source| ReplacementError {
                    address: step.address.clone(),
                    new_physical_id: created.id.clone(),
                    old_physical_id: record.backend_id.clone(),
                    reason: source.to_string(),
                })?;
                METRICS.inc_deleted();
                (NodeAction::Replaced, created.id, created.attributes)
            }
            None => {
                let created = retry_transient(retry, &step.address, || {
                    self.backend.create_resource(kind, &properties)
                })
                .await
                .map_err(backend_err)?;
                METRICS.inc_created();
                (NodeAction::Created, created.id, created.attributes)
            }
        };

        self.store
            .put_resource(
                &self.id,
                resource_record(step, &backend_id, &attributes, digest),
            )
            .await?;
        Ok(Settled { action, attributes })
    }

    /// Delete backend resources left behind by earlier kind-changing
    /// replacements. Ids that still fail stay recorded.
    async fn retry_pending_deletes(
        &self,
        address: &str,
        mut record: ResourceRecord,
    ) -> DeployResult<ResourceRecord> {
        let mut failure = None;
        let mut still_pending = Vec::new();
        for pending in std::mem::take(&mut record.pending_deletes) {
            let kind = ResourceKind::from_label(&pending.kind);
            let deleted = retry_transient(&self.config.retry, address, || {
                self.backend.delete_resource(&pending.backend_id, &kind)
            })
            .await;
            match deleted {
                Ok(()) => {
                    METRICS.inc_deleted();
                    info!(address = %address, backend_id = %pending.backend_id, "replaced resource deleted");
                }
                Err(err) => {
                    failure.get_or_insert((pending.backend_id.clone(), err.to_string()));
                    still_pending.push(pending);
                }
            }
        }
        record.pending_deletes = still_pending;
        record.updated_at = Utc::now();
        self.store.put_resource(&self.id, record.clone()).await?;

        match failure {
            None => Ok(record),
            Some((old_physical_id, reason)) => Err(ReplacementError {
                address: address.to_string(),
                new_physical_id: record.backend_id.clone(),
                old_physical_id,
                reason,
            }
            .into()),
        }
    }

    async fn fail_step(
        &self,
        plan: &DeployPlan,
        step: &PlanStep,
        error: DeployError,
        recorder: &DeployRunRecorder,
        report: &mut DeployReport,
        blocked: &mut BTreeSet<String>,
    ) -> DeployResult<()> {
        obs::emit_resource_failed(&step.address, &error);
        recorder
            .record(
                "resource_failed",
                json!({ "address": step.address, "error": error.to_string() }),
            )
            .await?;
        blocked.extend(plan.transitive_dependents(&step.address));
        report.failed.push(NodeFailure {
            address: step.address.clone(),
            error,
        });
        Ok(())
    }

    /// Publish the outputs of every group whose members have all settled
    /// and whose consumed groups have published.
    async fn publish_ready_groups(
        &self,
        plan: &DeployPlan,
        attributes: &HashMap<String, BTreeMap<String, String>>,
        published: &mut BTreeSet<String>,
        failed_groups: &mut BTreeSet<String>,
        recorder: &DeployRunRecorder,
        report: &mut DeployReport,
    ) -> DeployResult<()> {
        loop {
            let ready = plan.groups.iter().find(|g| {
                !published.contains(&g.id)
                    && !failed_groups.contains(&g.id)
                    && g.members.iter().all(|m| attributes.contains_key(m))
                    && g.consumes.iter().all(|c| published.contains(c))
            });
            let Some(group) = ready else {
                return Ok(());
            };

            let origin = format!("{}/outputs", group.id);
            let scope = ResolutionScope {
                origin: &origin,
                group: &group.id,
                params: &plan.params,
                attributes,
                outputs: &report.outputs,
            };
            let resolved: Result<BTreeMap<String, String>, PlanError> = group
                .outputs
                .iter()
                .map(|(name, value)| Ok((name.clone(), output_string(&scope.resolve(value)?))))
                .collect();

            match resolved {
                Ok(outputs) => {
                    self.store
                        .publish_outputs(&self.id, &group.id, outputs.clone())
                        .await?;
                    obs::emit_outputs_published(&group.id, outputs.len());
                    recorder
                        .record(
                            "outputs_published",
                            json!({ "group": group.id, "count": outputs.len() }),
                        )
                        .await?;
                    published.insert(group.id.clone());
                    report.outputs.insert(group.id.clone(), outputs);
                }
                Err(err) => {
                    let error = DeployError::Plan(err);
                    obs::emit_resource_failed(&origin, &error);
                    recorder
                        .record(
                            "resource_failed",
                            json!({ "address": origin, "error": error.to_string() }),
                        )
                        .await?;
                    failed_groups.insert(group.id.clone());
                    report.failed.push(NodeFailure {
                        address: origin,
                        error,
                    });
                }
            }
        }
    }

    /// Remove `records` dependents-first. When a removal fails, everything
    /// it depends on is kept.
    async fn teardown(
        &self,
        mut records: BTreeMap<String, Stale>,
        recorder: &DeployRunRecorder,
        report: &mut DeployReport,
    ) -> DeployResult<()> {
        let edges: BTreeMap<String, Vec<String>> = records
            .iter()
            .map(|(address, r)| (address.clone(), r.depends_on().to_vec()))
            .collect();
        let mut held: BTreeSet<String> = BTreeSet::new();

        for address in teardown_order(&edges) {
            let Some(record) = records.remove(&address) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                report.cancelled = true;
            }
            if report.cancelled || held.contains(&address) {
                obs::emit_resource_skipped(&address, "dependent not removed");
                held.extend(record.depends_on().iter().cloned());
                report.skipped.push(address);
                continue;
            }
            match self.remove_one(&address, &record).await {
                Ok(action) => {
                    obs::emit_resource_settled(&address, &action.to_string());
                    recorder
                        .record(
                            "resource_removed",
                            json!({ "address": address, "action": action }),
                        )
                        .await?;
                    report.removed.push((address, action));
                }
                Err(error) => {
                    obs::emit_resource_failed(&address, &error);
                    recorder
                        .record(
                            "resource_failed",
                            json!({ "address": address, "error": error.to_string() }),
                        )
                        .await?;
                    held.extend(record.depends_on().iter().cloned());
                    report.failed.push(NodeFailure { address, error });
                }
            }
        }
        Ok(())
    }

    async fn remove_one(&self, address: &str, record: &Stale) -> DeployResult<NodeAction> {
        match record {
            Stale::Custom(_) => {
                let outcome = self.controller.remove(address).await?;
                Ok(match outcome {
                    TransitionOutcome::Retained { .. } => NodeAction::Retained,
                    _ => NodeAction::Deleted,
                })
            }
            Stale::Resource(record) if !record.pending_deletes.is_empty() => {
                let record = self.retry_pending_deletes(address, record.clone()).await?;
                self.remove_backend(address, &record).await
            }
            Stale::Resource(record) => self.remove_backend(address, record).await,
        }
    }

    async fn remove_backend(
        &self,
        address: &str,
        record: &ResourceRecord,
    ) -> DeployResult<NodeAction> {
        match record.removal_policy {
            RemovalPolicy::Retain | RemovalPolicy::Snapshot => {
                if record.removal_policy == RemovalPolicy::Snapshot {
                    warn!(address = %address, "snapshot is not supported; retaining instead");
                }
                self.store.remove_resource(&self.id, address).await?;
                Ok(NodeAction::Retained)
            }
            RemovalPolicy::Destroy => {
                let kind = ResourceKind::from_label(&record.kind);
                retry_transient(&self.config.retry, address, || {
                    self.backend.delete_resource(&record.backend_id, &kind)
                })
                .await
                .map_err(|source| DeployError::Backend {
                    address: address.to_string(),
                    source,
                })?;
                self.store.remove_resource(&self.id, address).await?;
                METRICS.inc_deleted();
                Ok(NodeAction::Deleted)
            }
        }
    }

    async fn finish(&self, recorder: DeployRunRecorder, report: &DeployReport, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let summary = report.summary(recorder.events_recorded(), duration_ms);
        let run_id = report.run_id.to_string();
        let finished = if report.cancelled {
            recorder.finish_cancelled(summary).await
        } else if report.failed.is_empty() {
            recorder.finish_ok(summary).await
        } else {
            recorder.finish_err(summary).await
        };
        if let Err(err) = finished {
            obs::emit_run_finalize_error(&run_id, &err);
        }
        obs::emit_deploy_finished(
            self.id.as_str(),
            &run_id,
            duration_ms,
            report.settled.len() + report.removed.len(),
            report.failed.len(),
            report.success(),
        );
        METRICS.flush();
    }
}

fn resource_record(
    step: &PlanStep,
    backend_id: &str,
    attributes: &BTreeMap<String, String>,
    digest: ContentDigest,
) -> ResourceRecord {
    ResourceRecord {
        address: step.address.clone(),
        group: step.group.clone(),
        kind: step.resource.kind.as_str().to_string(),
        backend_id: backend_id.to_string(),
        attributes: attributes.clone(),
        properties_digest: digest,
        depends_on: step.depends_on.clone(),
        removal_policy: step.resource.removal_policy,
        pending_deletes: Vec::new(),
        updated_at: Utc::now(),
    }
}

struct StaleSet {
    records: BTreeMap<String, Stale>,
    /// Groups with published outputs that are no longer defined
    groups: Vec<String>,
}

fn stale_records(plan: &DeployPlan, prior: DeploymentState) -> StaleSet {
    let mut records = BTreeMap::new();
    for (address, record) in prior.resources {
        if !plan.contains(&address) {
            records.insert(address, Stale::Resource(record));
        }
    }
    for (address, record) in prior.custom_resources {
        if !plan.contains(&address) {
            records.insert(address, Stale::Custom(record));
        }
    }
    let groups = prior
        .outputs
        .into_keys()
        .filter(|g| plan.group(g).is_none())
        .collect();
    StaleSet { records, groups }
}

/// Dependents before their dependencies. Edges to addresses outside
/// `edges` are ignored.
fn teardown_order(edges: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, Vec<String>>,
        seen: &mut BTreeSet<&'a str>,
        order: &mut Vec<String>,
    ) {
        if !seen.insert(node) {
            return;
        }
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if edges.contains_key(dep) {
                    visit(dep, edges, seen, order);
                }
            }
        }
        order.push(node.to_string());
    }

    let mut seen = BTreeSet::new();
    let mut order = Vec::with_capacity(edges.len());
    for node in edges.keys() {
        visit(node, edges, &mut seen, &mut order);
    }
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_order_puts_dependents_first() {
        let edges = BTreeMap::from([
            ("a/bucket".to_string(), vec![]),
            ("a/role".to_string(), vec![]),
            (
                "a/stream".to_string(),
                vec!["a/bucket".to_string(), "a/role".to_string()],
            ),
            ("b/fn".to_string(), vec!["a/role".to_string(), "gone/x".to_string()]),
        ]);
        let order = teardown_order(&edges);
        let pos = |a: &str| order.iter().position(|x| x == a).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos("a/stream") < pos("a/bucket"));
        assert!(pos("a/stream") < pos("a/role"));
        assert!(pos("b/fn") < pos("a/role"));
    }

    #[test]
    fn report_success_requires_no_failures_and_no_cancel() {
        let mut report = DeployReport::new(RunId::new());
        assert!(report.success());
        report.cancelled = true;
        assert!(!report.success());
        report.cancelled = false;
        report.failed.push(NodeFailure {
            address: "a/x".into(),
            error: DeployError::Cancelled,
        });
        assert!(!report.success());
        assert!(matches!(report.failure_for("a/x"), Some(DeployError::Cancelled)));
    }

    #[test]
    fn executor_config_never_zero_concurrency() {
        let config = ExecutorConfig::from(&DeployConfig {
            max_concurrent: 0,
            ..DeployConfig::default()
        });
        assert_eq!(config.max_concurrent, 1);
    }
}
