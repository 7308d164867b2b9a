//! Custom-resource lifecycle controller.
//!
//! Drives each custom resource through
//! `Absent -> Creating -> Created -> Updating -> Created` and
//! `Created -> Deleting -> Absent` by calling its handler.
//!
//! Persistence rules:
//! - A physical id is recorded only after a successful CREATE. A failed
//!   CREATE leaves nothing behind, so the next deploy creates again.
//! - UPDATE is only sent when the resolved properties changed.
//!   A removal policy or dependency change alone is recorded without one.
//! - When UPDATE returns a new physical id, the new id is recorded before
//!   the old one is deleted. If that DELETE fails the old id stays in
//!   `pending_deletes` and the failure is reported as a [`ReplacementError`].
//! - A failed transition leaves the resource in its last settled state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stackwire_state::{CustomResourceRecord, DeploymentId, RemovalPolicy, StateStore};
use tracing::{info, instrument, warn};

use super::error::{ReplacementError, TransitionError};
use super::handler::CallbackHandler;
use super::lease::{Lease, LeaseTable};
use super::protocol::{HandlerRequest, HandlerResponse, RequestType, ResponseStatus};
use super::SERVICE_TOKEN;
use crate::config::DeployConfig;
use crate::error::DeployResult;
use crate::graph::{ResolvedProperties, Scalar};
use crate::metrics::METRICS;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Absent,
    Creating,
    Created,
    Updating,
    Deleting,
}

/// A custom resource with every property resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomResourceInvocation {
    pub address: String,
    pub group: String,
    pub logical_id: String,
    pub handler_ref: String,
    pub properties: BTreeMap<String, Scalar>,
    pub removal_policy: RemovalPolicy,
    pub depends_on: Vec<String>,
}

impl CustomResourceInvocation {
    /// Split resolved properties into the handler reference and the
    /// scalar properties sent to the handler.
    pub fn from_resolved(
        address: &str,
        group: &str,
        logical_id: &str,
        mut properties: ResolvedProperties,
        removal_policy: RemovalPolicy,
        depends_on: Vec<String>,
    ) -> Result<Self, TransitionError> {
        let invalid = |reason: String| TransitionError::InvalidInvocation {
            address: address.to_string(),
            reason,
        };
        let handler_ref = match properties.remove(SERVICE_TOKEN) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            _ => return Err(invalid(format!("{SERVICE_TOKEN} must resolve to a non-empty string"))),
        };
        let properties = properties
            .into_iter()
            .map(|(k, v)| match Scalar::from_json(&v) {
                Some(s) => Ok((k, s)),
                None => Err(invalid(format!("property '{k}' is not a scalar"))),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            address: address.to_string(),
            group: group.to_string(),
            logical_id: logical_id.to_string(),
            handler_ref,
            properties,
            removal_policy,
            depends_on,
        })
    }

    fn properties_json(&self) -> BTreeMap<String, serde_json::Value> {
        self.properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

/// Result of a lifecycle operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Created {
        physical_id: String,
        data: BTreeMap<String, String>,
    },
    Updated {
        physical_id: String,
        data: BTreeMap<String, String>,
    },
    /// UPDATE returned a new physical id and the old one was deleted
    Replaced {
        physical_id: String,
        previous_physical_id: String,
        data: BTreeMap<String, String>,
    },
    /// Properties unchanged; no handler call was made
    Unchanged {
        physical_id: String,
        data: BTreeMap<String, String>,
    },
    Deleted {
        physical_id: String,
    },
    /// Forgotten without a DELETE, per removal policy
    Retained {
        physical_id: String,
        policy: RemovalPolicy,
    },
    AlreadyAbsent,
}

impl TransitionOutcome {
    pub fn physical_id(&self) -> Option<&str> {
        match self {
            TransitionOutcome::Created { physical_id, .. }
            | TransitionOutcome::Updated { physical_id, .. }
            | TransitionOutcome::Replaced { physical_id, .. }
            | TransitionOutcome::Unchanged { physical_id, .. }
            | TransitionOutcome::Deleted { physical_id }
            | TransitionOutcome::Retained { physical_id, .. } => Some(physical_id),
            TransitionOutcome::AlreadyAbsent => None,
        }
    }

    pub fn data(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            TransitionOutcome::Created { data, .. }
            | TransitionOutcome::Updated { data, .. }
            | TransitionOutcome::Replaced { data, .. }
            | TransitionOutcome::Unchanged { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Handler timing and retry settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub handler_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long to wait for another transition on the same resource
    pub lease_wait: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&DeployConfig::default())
    }
}

impl From<&DeployConfig> for ControllerConfig {
    fn from(config: &DeployConfig) -> Self {
        let handler_timeout = config.handler_timeout();
        Self {
            handler_timeout,
            retry: config.retry_policy(),
            lease_wait: handler_timeout * (config.max_retries + 1),
        }
    }
}

pub struct LifecycleController {
    deployment: DeploymentId,
    handler: Arc<dyn CallbackHandler>,
    store: Arc<dyn StateStore>,
    config: ControllerConfig,
    leases: Arc<LeaseTable>,
}

impl LifecycleController {
    pub fn new(
        deployment: DeploymentId,
        handler: Arc<dyn CallbackHandler>,
        store: Arc<dyn StateStore>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            deployment,
            handler,
            store,
            config,
            leases: LeaseTable::new(),
        }
    }

    /// Current state: transient while a transition is in flight, otherwise
    /// `Created` if a record exists and `Absent` if not.
    pub async fn state_of(&self, address: &str) -> DeployResult<LifecycleState> {
        if let Some(state) = self.leases.transient_state(address) {
            return Ok(state);
        }
        let record = self
            .store
            .get_custom_resource(&self.deployment, address)
            .await?;
        Ok(match record {
            Some(_) => LifecycleState::Created,
            None => LifecycleState::Absent,
        })
    }

    /// Bring the resource in line with `invocation`.
    #[instrument(skip(self, invocation), fields(address = %invocation.address))]
    pub async fn apply(
        &self,
        invocation: &CustomResourceInvocation,
    ) -> DeployResult<TransitionOutcome> {
        let lease =
            LeaseTable::acquire(&self.leases, &invocation.address, self.config.lease_wait).await?;
        let existing = self
            .store
            .get_custom_resource(&self.deployment, &invocation.address)
            .await?;
        match existing {
            None => self.create(&lease, invocation).await,
            Some(record) => {
                let record = self.retry_pending_deletes(&lease, record).await?;
                if record.properties == invocation.properties_json()
                    && record.handler_ref == invocation.handler_ref
                {
                    if record.removal_policy != invocation.removal_policy
                        || record.depends_on != invocation.depends_on
                    {
                        self.store
                            .put_custom_resource(
                                &self.deployment,
                                record_for(
                                    invocation,
                                    &record.physical_id,
                                    record.data.clone(),
                                    record.pending_deletes.clone(),
                                ),
                            )
                            .await?;
                    }
                    return Ok(TransitionOutcome::Unchanged {
                        physical_id: record.physical_id,
                        data: record.data,
                    });
                }
                self.update(&lease, invocation, record).await
            }
        }
    }

    /// Remove the resource according to its recorded removal policy.
    #[instrument(skip(self))]
    pub async fn remove(&self, address: &str) -> DeployResult<TransitionOutcome> {
        let lease = LeaseTable::acquire(&self.leases, address, self.config.lease_wait).await?;
        let Some(record) = self
            .store
            .get_custom_resource(&self.deployment, address)
            .await?
        else {
            return Ok(TransitionOutcome::AlreadyAbsent);
        };

        match record.removal_policy {
            RemovalPolicy::Retain | RemovalPolicy::Snapshot => {
                if record.removal_policy == RemovalPolicy::Snapshot {
                    warn!(
                        address = %address,
                        "custom resources cannot be snapshotted; retaining instead"
                    );
                }
                self.store
                    .remove_custom_resource(&self.deployment, address)
                    .await?;
                info!(address = %address, physical_id = %record.physical_id, "custom resource retained");
                Ok(TransitionOutcome::Retained {
                    physical_id: record.physical_id,
                    policy: record.removal_policy,
                })
            }
            RemovalPolicy::Destroy => {
                let record = self.retry_pending_deletes(&lease, record).await?;
                lease.enter(LifecycleState::Deleting);
                let request = HandlerRequest {
                    request_type: RequestType::Delete,
                    logical_id: logical_id_of(address).to_string(),
                    physical_id: Some(record.physical_id.clone()),
                    properties: scalars(&record.properties),
                    old_properties: None,
                };
                self.invoke(address, &record.handler_ref, &request).await?;
                self.store
                    .remove_custom_resource(&self.deployment, address)
                    .await?;
                METRICS.inc_deleted();
                crate::obs::emit_transition(address, "DELETE", &record.physical_id);
                Ok(TransitionOutcome::Deleted {
                    physical_id: record.physical_id,
                })
            }
        }
    }

    async fn create(
        &self,
        lease: &Lease,
        invocation: &CustomResourceInvocation,
    ) -> DeployResult<TransitionOutcome> {
        lease.enter(LifecycleState::Creating);
        let request = HandlerRequest {
            request_type: RequestType::Create,
            logical_id: invocation.logical_id.clone(),
            physical_id: None,
            properties: invocation.properties.clone(),
            old_properties: None,
        };
        let response = self
            .invoke(&invocation.address, &invocation.handler_ref, &request)
            .await?;
        let physical_id = response
            .physical_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransitionError::MissingPhysicalId {
                address: invocation.address.clone(),
            })?;

        self.store
            .put_custom_resource(
                &self.deployment,
                record_for(invocation, &physical_id, response.data.clone(), Vec::new()),
            )
            .await?;
        METRICS.inc_created();
        crate::obs::emit_transition(&invocation.address, "CREATE", &physical_id);
        Ok(TransitionOutcome::Created {
            physical_id,
            data: response.data,
        })
    }

    async fn update(
        &self,
        lease: &Lease,
        invocation: &CustomResourceInvocation,
        record: CustomResourceRecord,
    ) -> DeployResult<TransitionOutcome> {
        lease.enter(LifecycleState::Updating);
        let request = HandlerRequest {
            request_type: RequestType::Update,
            logical_id: invocation.logical_id.clone(),
            physical_id: Some(record.physical_id.clone()),
            properties: invocation.properties.clone(),
            old_properties: Some(scalars(&record.properties)),
        };
        let response = self
            .invoke(&invocation.address, &invocation.handler_ref, &request)
            .await?;
        let new_id = response
            .physical_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| record.physical_id.clone());

        if new_id == record.physical_id {
            self.store
                .put_custom_resource(
                    &self.deployment,
                    record_for(invocation, &new_id, response.data.clone(), record.pending_deletes),
                )
                .await?;
            METRICS.inc_updated();
            crate::obs::emit_transition(&invocation.address, "UPDATE", &new_id);
            return Ok(TransitionOutcome::Updated {
                physical_id: new_id,
                data: response.data,
            });
        }

        // Replacement: the new resource is recorded before the old one goes.
        let old_id = record.physical_id.clone();
        let mut pending = record.pending_deletes.clone();
        pending.push(old_id.clone());
        let mut replaced = record_for(invocation, &new_id, response.data.clone(), pending);
        self.store
            .put_custom_resource(&self.deployment, replaced.clone())
            .await?;
        METRICS.inc_updated();
        crate::obs::emit_transition(&invocation.address, "UPDATE", &new_id);

        lease.enter(LifecycleState::Deleting);
        let delete = HandlerRequest {
            request_type: RequestType::Delete,
            logical_id: invocation.logical_id.clone(),
            physical_id: Some(old_id.clone()),
            properties: scalars(&record.properties),
            old_properties: None,
        };
        if let Err(err) = self
            .invoke(&invocation.address, &record.handler_ref, &delete)
            .await
        {
            return Err(ReplacementError {
                address: invocation.address.clone(),
                new_physical_id: new_id,
                old_physical_id: old_id,
                reason: err.to_string(),
            }
            .into());
        }
        replaced.pending_deletes.retain(|id| id != &old_id);
        self.store
            .put_custom_resource(&self.deployment, replaced)
            .await?;
        crate::obs::emit_transition(&invocation.address, "DELETE", &old_id);
        Ok(TransitionOutcome::Replaced {
            physical_id: new_id,
            previous_physical_id: old_id,
            data: response.data,
        })
    }

    /// DELETE physical ids left behind by earlier replacements.
    async fn retry_pending_deletes(
        &self,
        lease: &Lease,
        mut record: CustomResourceRecord,
    ) -> DeployResult<CustomResourceRecord> {
        if record.pending_deletes.is_empty() {
            return Ok(record);
        }
        lease.enter(LifecycleState::Deleting);
        let mut failure = None;
        let mut still_pending = Vec::new();
        for old_id in std::mem::take(&mut record.pending_deletes) {
            let request = HandlerRequest {
                request_type: RequestType::Delete,
                logical_id: logical_id_of(&record.address).to_string(),
                physical_id: Some(old_id.clone()),
                properties: scalars(&record.properties),
                old_properties: None,
            };
            match self.invoke(&record.address, &record.handler_ref, &request).await {
                Ok(_) => crate::obs::emit_transition(&record.address, "DELETE", &old_id),
                Err(err) => {
                    failure.get_or_insert((old_id.clone(), err.to_string()));
                    still_pending.push(old_id);
                }
            }
        }
        record.pending_deletes = still_pending;
        record.updated_at = Utc::now();
        self.store
            .put_custom_resource(&self.deployment, record.clone())
            .await?;
        lease.enter(LifecycleState::Created);

        match failure {
            None => Ok(record),
            Some((old_physical_id, reason)) => Err(ReplacementError {
                address: record.address.clone(),
                new_physical_id: record.physical_id.clone(),
                old_physical_id,
                reason,
            }
            .into()),
        }
    }

    /// Send one request, retrying transport failures and timeouts. A
    /// `FAILED` response is final.
    async fn invoke(
        &self,
        address: &str,
        handler_ref: &str,
        request: &HandlerRequest,
    ) -> Result<HandlerResponse, TransitionError> {
        let max_attempts = self.config.retry.max_attempts();
        let limit_ms = self.config.handler_timeout.as_millis() as u64;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            METRICS.inc_handler_invocations();
            let result =
                tokio::time::timeout(self.config.handler_timeout, self.handler.invoke(handler_ref, request))
                    .await;
            let error = match result {
                Ok(Ok(response)) => match response.status {
                    ResponseStatus::Success => return Ok(response),
                    ResponseStatus::Failed => {
                        return Err(TransitionError::HandlerFailed {
                            address: address.to_string(),
                            request_type: request.request_type,
                            reason: response
                                .reason
                                .unwrap_or_else(|| "handler gave no reason".to_string()),
                        })
                    }
                },
                Ok(Err(err)) => TransitionError::Transport {
                    address: address.to_string(),
                    request_type: request.request_type,
                    reason: err.to_string(),
                },
                Err(_elapsed) => TransitionError::Timeout {
                    address: address.to_string(),
                    request_type: request.request_type,
                    limit_ms,
                },
            };
            warn!(
                address = %address,
                request_type = %request.request_type,
                attempt = attempt,
                error = %error,
                "handler invocation failed"
            );
            last_error = Some(error);
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
            }
        }

        Err(last_error.unwrap_or(TransitionError::Timeout {
            address: address.to_string(),
            request_type: request.request_type,
            limit_ms,
        }))
    }
}

fn logical_id_of(address: &str) -> &str {
    address.rsplit_once('/').map_or(address, |(_, id)| id)
}

fn scalars(properties: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, Scalar> {
    properties
        .iter()
        .filter_map(|(k, v)| Scalar::from_json(v).map(|s| (k.clone(), s)))
        .collect()
}

fn record_for(
    invocation: &CustomResourceInvocation,
    physical_id: &str,
    data: BTreeMap<String, String>,
    pending_deletes: Vec<String>,
) -> CustomResourceRecord {
    CustomResourceRecord {
        address: invocation.address.clone(),
        group: invocation.group.clone(),
        handler_ref: invocation.handler_ref.clone(),
        physical_id: physical_id.to_string(),
        properties: invocation.properties_json(),
        data,
        removal_policy: invocation.removal_policy,
        depends_on: invocation.depends_on.clone(),
        pending_deletes,
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_resource::handler::HandlerError;
    use crate::error::DeployError;
    use async_trait::async_trait;
    use stackwire_state::fakes::MemoryStateStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Handler that replays scripted responses and records every request.
    #[derive(Default)]
    struct ScriptedHandler {
        script: Mutex<VecDeque<Result<HandlerResponse, HandlerError>>>,
        requests: Mutex<Vec<HandlerRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedHandler {
        fn with(script: Vec<Result<HandlerResponse, HandlerError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn requests(&self) -> Vec<HandlerRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CallbackHandler for ScriptedHandler {
        async fn invoke(
            &self,
            _handler_ref: &str,
            request: &HandlerRequest,
        ) -> Result<HandlerResponse, HandlerError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HandlerResponse::success("default-id")))
        }
    }

    fn invocation(host: &str) -> CustomResourceInvocation {
        CustomResourceInvocation {
            address: "app/customizer".into(),
            group: "app".into(),
            logical_id: "customizer".into(),
            handler_ref: "arn:aws:lambda:us-east-1:123456789012:function:c".into(),
            properties: BTreeMap::from([("Host".to_string(), Scalar::from(host))]),
            removal_policy: RemovalPolicy::Destroy,
            depends_on: vec![],
        }
    }

    fn controller(handler: Arc<ScriptedHandler>) -> (LifecycleController, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let config = ControllerConfig {
            handler_timeout: Duration::from_millis(100),
            retry: RetryPolicy {
                max_retries: 1,
                backoff_base_ms: 1,
            },
            lease_wait: Duration::from_millis(500),
        };
        let controller =
            LifecycleController::new(DeploymentId::new("dash"), handler, store.clone(), config);
        (controller, store)
    }

    #[tokio::test]
    async fn create_then_unchanged_then_update() {
        let handler = ScriptedHandler::with(vec![
            Ok(HandlerResponse::success("p1")),
            Ok(HandlerResponse::success("p1")),
        ]);
        let (controller, _store) = controller(handler.clone());

        let created = controller.apply(&invocation("h1")).await.unwrap();
        assert!(matches!(created, TransitionOutcome::Created { ref physical_id, .. } if physical_id == "p1"));
        assert_eq!(
            controller.state_of("app/customizer").await.unwrap(),
            LifecycleState::Created
        );

        let again = controller.apply(&invocation("h1")).await.unwrap();
        assert!(matches!(again, TransitionOutcome::Unchanged { .. }));
        assert_eq!(handler.requests().len(), 1);

        let updated = controller.apply(&invocation("h2")).await.unwrap();
        assert!(matches!(updated, TransitionOutcome::Updated { .. }));
        let requests = handler.requests();
        assert_eq!(requests[1].request_type, RequestType::Update);
        assert_eq!(requests[1].physical_id.as_deref(), Some("p1"));
        assert_eq!(
            requests[1].old_properties.as_ref().unwrap()["Host"],
            Scalar::from("h1")
        );
    }

    #[tokio::test]
    async fn failed_create_leaves_resource_absent() {
        let handler = ScriptedHandler::with(vec![Ok(HandlerResponse::failed("boom"))]);
        let (controller, store) = controller(handler.clone());

        let err = controller.apply(&invocation("h1")).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Transition(TransitionError::HandlerFailed { .. })
        ));
        assert_eq!(
            controller.state_of("app/customizer").await.unwrap(),
            LifecycleState::Absent
        );
        assert!(store
            .get_custom_resource(&DeploymentId::new("dash"), "app/customizer")
            .await
            .unwrap()
            .is_none());
        // FAILED is not retried
        assert_eq!(handler.requests().len(), 1);
    }

    #[tokio::test]
    async fn success_without_physical_id_is_rejected() {
        let mut response = HandlerResponse::success("x");
        response.physical_id = None;
        let handler = ScriptedHandler::with(vec![Ok(response)]);
        let (controller, _store) = controller(handler);
        let err = controller.apply(&invocation("h1")).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Transition(TransitionError::MissingPhysicalId { .. })
        ));
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let handler = ScriptedHandler::with(vec![
            Err(HandlerError::Transport("connection reset".into())),
            Ok(HandlerResponse::success("p1")),
        ]);
        let (controller, _store) = controller(handler.clone());
        controller.apply(&invocation("h1")).await.unwrap();
        assert_eq!(handler.requests().len(), 2);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let handler = Arc::new(ScriptedHandler {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (controller, _store) = controller(handler.clone());
        let err = controller.apply(&invocation("h1")).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Transition(TransitionError::Timeout { limit_ms: 100, .. })
        ));
        assert_eq!(handler.requests().len(), 2);
    }

    #[tokio::test]
    async fn replacement_records_new_id_before_deleting_old() {
        let handler = ScriptedHandler::with(vec![
            Ok(HandlerResponse::success("p1")),
            Ok(HandlerResponse::success("p2")),
            Ok(HandlerResponse::success("p1")),
        ]);
        let (controller, store) = controller(handler.clone());
        controller.apply(&invocation("h1")).await.unwrap();

        let outcome = controller.apply(&invocation("h2")).await.unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Replaced {
                physical_id: "p2".into(),
                previous_physical_id: "p1".into(),
                data: BTreeMap::new(),
            }
        );
        let requests = handler.requests();
        assert_eq!(requests[2].request_type, RequestType::Delete);
        assert_eq!(requests[2].physical_id.as_deref(), Some("p1"));

        let record = store
            .get_custom_resource(&DeploymentId::new("dash"), "app/customizer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.physical_id, "p2");
        assert!(record.pending_deletes.is_empty());
    }

    #[tokio::test]
    async fn failed_delete_of_replaced_id_is_surfaced_and_retried() {
        let handler = ScriptedHandler::with(vec![
            Ok(HandlerResponse::success("p1")),
            Ok(HandlerResponse::success("p2")),
            Ok(HandlerResponse::failed("still in use")),
            Ok(HandlerResponse::success("p1")),
        ]);
        let (controller, store) = controller(handler.clone());
        controller.apply(&invocation("h1")).await.unwrap();

        let err = controller.apply(&invocation("h2")).await.unwrap_err();
        match err {
            DeployError::Replacement(e) => {
                assert_eq!(e.new_physical_id, "p2");
                assert_eq!(e.old_physical_id, "p1");
            }
            other => panic!("expected replacement error, got {other:?}"),
        }
        let record = store
            .get_custom_resource(&DeploymentId::new("dash"), "app/customizer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.physical_id, "p2");
        assert_eq!(record.pending_deletes, vec!["p1".to_string()]);

        // Next apply retries the orphaned DELETE first, then finds nothing to change.
        let outcome = controller.apply(&invocation("h2")).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Unchanged { .. }));
        let requests = handler.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].physical_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn retain_policy_forgets_without_delete() {
        let handler = ScriptedHandler::with(vec![Ok(HandlerResponse::success("p1"))]);
        let (controller, _store) = controller(handler.clone());
        let mut inv = invocation("h1");
        inv.removal_policy = RemovalPolicy::Retain;
        controller.apply(&inv).await.unwrap();

        let outcome = controller.remove("app/customizer").await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Retained { .. }));
        assert_eq!(handler.requests().len(), 1);
        assert_eq!(
            controller.state_of("app/customizer").await.unwrap(),
            LifecycleState::Absent
        );
    }

    #[tokio::test]
    async fn switching_to_retain_is_recorded_without_a_handler_call() {
        let handler = ScriptedHandler::with(vec![Ok(HandlerResponse::success("p1"))]);
        let (controller, store) = controller(handler.clone());
        controller.apply(&invocation("h1")).await.unwrap();

        let mut inv = invocation("h1");
        inv.removal_policy = RemovalPolicy::Retain;
        inv.depends_on = vec!["app/customizerFn".to_string()];
        let outcome = controller.apply(&inv).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Unchanged { ref physical_id, .. } if physical_id == "p1"));
        assert_eq!(handler.requests().len(), 1);

        let record = store
            .get_custom_resource(&DeploymentId::new("dash"), "app/customizer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.removal_policy, RemovalPolicy::Retain);
        assert_eq!(record.depends_on, vec!["app/customizerFn".to_string()]);

        let removed = controller.remove("app/customizer").await.unwrap();
        assert!(matches!(removed, TransitionOutcome::Retained { .. }));
        assert_eq!(handler.requests().len(), 1);
    }

    #[tokio::test]
    async fn destroy_policy_sends_delete_with_physical_id() {
        let handler = ScriptedHandler::with(vec![
            Ok(HandlerResponse::success("p1")),
            Ok(HandlerResponse::success("p1")),
        ]);
        let (controller, _store) = controller(handler.clone());
        controller.apply(&invocation("h1")).await.unwrap();

        let outcome = controller.remove("app/customizer").await.unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Deleted {
                physical_id: "p1".into()
            }
        );
        let delete = &handler.requests()[1];
        assert_eq!(delete.request_type, RequestType::Delete);
        assert_eq!(delete.physical_id.as_deref(), Some("p1"));
        assert_eq!(delete.logical_id, "customizer");

        assert_eq!(
            controller.remove("app/customizer").await.unwrap(),
            TransitionOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn failed_delete_keeps_resource_created() {
        let handler = ScriptedHandler::with(vec![
            Ok(HandlerResponse::success("p1")),
            Ok(HandlerResponse::failed("denied")),
        ]);
        let (controller, _store) = controller(handler);
        controller.apply(&invocation("h1")).await.unwrap();
        assert!(controller.remove("app/customizer").await.is_err());
        assert_eq!(
            controller.state_of("app/customizer").await.unwrap(),
            LifecycleState::Created
        );
    }

    #[tokio::test]
    async fn concurrent_applies_serialize_per_resource() {
        let handler = Arc::new(ScriptedHandler {
            delay: Some(Duration::from_millis(20)),
            script: Mutex::new(VecDeque::from([Ok(HandlerResponse::success("p1"))])),
            ..Default::default()
        });
        let (controller, _store) = controller(handler.clone());
        let inv = invocation("h1");
        let (a, b) = tokio::join!(controller.apply(&inv), controller.apply(&inv));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, TransitionOutcome::Created { .. }))
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, TransitionOutcome::Unchanged { .. }))
                .count(),
            1
        );
        assert_eq!(handler.requests().len(), 1);
    }

    #[test]
    fn invocation_extracts_service_token() {
        let props = BTreeMap::from([
            (SERVICE_TOKEN.to_string(), serde_json::json!("arn:fn")),
            ("Region".to_string(), serde_json::json!("us-east-1")),
        ]);
        let inv = CustomResourceInvocation::from_resolved(
            "app/c",
            "app",
            "c",
            props,
            RemovalPolicy::Destroy,
            vec![],
        )
        .unwrap();
        assert_eq!(inv.handler_ref, "arn:fn");
        assert!(!inv.properties.contains_key(SERVICE_TOKEN));

        let missing = CustomResourceInvocation::from_resolved(
            "app/c",
            "app",
            "c",
            BTreeMap::new(),
            RemovalPolicy::Destroy,
            vec![],
        );
        assert!(matches!(
            missing,
            Err(TransitionError::InvalidInvocation { .. })
        ));
    }
}
