use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendError, ProvisionedResource, ProvisioningBackend};
use crate::graph::{ResolvedProperties, ResourceKind};

/// One call observed by [`SimulatedBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Create { kind: ResourceKind, id: String },
    Update { kind: ResourceKind, id: String },
    Delete { kind: ResourceKind, id: String },
}

impl BackendCall {
    pub fn id(&self) -> &str {
        match self {
            BackendCall::Create { id, .. }
            | BackendCall::Update { id, .. }
            | BackendCall::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug)]
struct LiveResource {
    kind: ResourceKind,
    attributes: BTreeMap<String, String>,
}

/// In-memory backend that fabricates plausible ids and attributes.
///
/// Used by the CLI for dry deployments and by tests, which can inject
/// failures per resource kind with [`SimulatedBackend::fail_next`].
#[derive(Debug)]
pub struct SimulatedBackend {
    region: String,
    account: String,
    live: Mutex<BTreeMap<String, LiveResource>>,
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<HashMap<ResourceKind, VecDeque<BackendError>>>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new("us-east-1", "000000000000")
    }
}

impl SimulatedBackend {
    pub fn new(region: &str, account: &str) -> Self {
        Self {
            region: region.to_string(),
            account: account.to_string(),
            live: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next operation on a resource of `kind` with `error`.
    pub fn fail_next(&self, kind: ResourceKind, error: BackendError) {
        self.failures
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Register a resource that already exists, e.g. one recorded in state
    /// by an earlier process. Adopting does not count as a call.
    pub fn adopt(&self, id: impl Into<String>, kind: ResourceKind, attributes: BTreeMap<String, String>) {
        self.live
            .lock()
            .unwrap()
            .insert(id.into(), LiveResource { kind, attributes });
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Ids of resources that currently exist.
    pub fn live_ids(&self) -> Vec<String> {
        self.live.lock().unwrap().keys().cloned().collect()
    }

    pub fn attributes_of(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.live
            .lock()
            .unwrap()
            .get(id)
            .map(|r| r.attributes.clone())
    }

    fn injected_failure(&self, kind: &ResourceKind) -> Result<(), BackendError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(kind).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn attributes(
        &self,
        kind: &ResourceKind,
        id: &str,
        properties: &ResolvedProperties,
    ) -> BTreeMap<String, String> {
        let name = name_property(kind)
            .and_then(|key| properties.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or(id)
            .to_string();
        let (region, account) = (self.region.as_str(), self.account.as_str());
        let mut attrs = BTreeMap::from([
            ("Id".to_string(), id.to_string()),
            ("Ref".to_string(), name.clone()),
        ]);
        let mut put = |k: &str, v: String| {
            attrs.insert(k.to_string(), v);
        };

        match kind {
            ResourceKind::SearchDomain => {
                let arn = format!("arn:aws:es:{region}:{account}:domain/{name}");
                put("DomainName", name.clone());
                put("DomainArn", arn.clone());
                put("Arn", arn);
                put("DomainEndpoint", format!("search-{name}.{region}.es.localhost"));
            }
            ResourceKind::UserPool => {
                let pool_id = format!("{region}_{}", &id[id.len().saturating_sub(8)..]);
                put("Arn", format!("arn:aws:cognito-idp:{region}:{account}:userpool/{pool_id}"));
                put("UserPoolId", pool_id.clone());
                put("ProviderName", format!("cognito-idp.{region}.amazonaws.com/{pool_id}"));
                put("Ref", pool_id);
            }
            ResourceKind::UserPoolDomain => {
                put("Domain", name.clone());
                put("CloudFrontDistribution", format!("{name}.auth.{region}.localhost"));
            }
            ResourceKind::IdentityPool => {
                let pool_id = format!("{region}:{id}");
                put("IdentityPoolId", pool_id.clone());
                put("Ref", pool_id);
            }
            ResourceKind::Role => {
                put("RoleName", name.clone());
                put("Arn", format!("arn:aws:iam::{account}:role/{name}"));
            }
            ResourceKind::ManagedPolicy => {
                put("Arn", format!("arn:aws:iam::{account}:policy/{name}"));
            }
            ResourceKind::LogGroup => {
                put("Arn", format!("arn:aws:logs:{region}:{account}:log-group:{name}"));
            }
            ResourceKind::Bucket => {
                put("BucketName", name.clone());
                put("Arn", format!("arn:aws:s3:::{name}"));
            }
            ResourceKind::DeliveryStream => {
                put("Arn", format!("arn:aws:firehose:{region}:{account}:deliverystream/{name}"));
            }
            ResourceKind::Function => {
                put("FunctionName", name.clone());
                put("Arn", format!("arn:aws:lambda:{region}:{account}:function:{name}"));
            }
            ResourceKind::EventRule => {
                put("Arn", format!("arn:aws:events:{region}:{account}:rule/{name}"));
            }
            ResourceKind::Generic(label) => {
                put("Arn", format!("arn:aws:{label}:{region}:{account}:{name}"));
            }
            ResourceKind::UserPoolUser
            | ResourceKind::IdentityPoolRoleAttachment
            | ResourceKind::LogStream
            | ResourceKind::Permission
            | ResourceKind::CustomResource => {}
        }
        attrs
    }
}

/// Property that carries the physical name of a resource, if any.
fn name_property(kind: &ResourceKind) -> Option<&'static str> {
    Some(match kind {
        ResourceKind::SearchDomain => "DomainName",
        ResourceKind::UserPool => "UserPoolName",
        ResourceKind::UserPoolDomain => "Domain",
        ResourceKind::UserPoolUser => "Username",
        ResourceKind::IdentityPool => "IdentityPoolName",
        ResourceKind::Role => "RoleName",
        ResourceKind::ManagedPolicy => "ManagedPolicyName",
        ResourceKind::LogGroup => "LogGroupName",
        ResourceKind::LogStream => "LogStreamName",
        ResourceKind::Bucket => "BucketName",
        ResourceKind::DeliveryStream => "DeliveryStreamName",
        ResourceKind::Function => "FunctionName",
        ResourceKind::EventRule => "Name",
        _ => return None,
    })
}

fn mint_id(kind: &ResourceKind) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    let slug: String = kind
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{slug}-{}", &uuid[..8])
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn create_resource(
        &self,
        kind: &ResourceKind,
        properties: &ResolvedProperties,
    ) -> Result<ProvisionedResource, BackendError> {
        self.injected_failure(kind)?;
        let id = mint_id(kind);
        let attributes = self.attributes(kind, &id, properties);
        debug!(kind = %kind, id = %id, "simulated create");
        self.live.lock().unwrap().insert(
            id.clone(),
            LiveResource {
                kind: kind.clone(),
                attributes: attributes.clone(),
            },
        );
        self.calls.lock().unwrap().push(BackendCall::Create {
            kind: kind.clone(),
            id: id.clone(),
        });
        Ok(ProvisionedResource { id, attributes })
    }

    async fn update_resource(
        &self,
        id: &str,
        kind: &ResourceKind,
        properties: &ResolvedProperties,
    ) -> Result<BTreeMap<String, String>, BackendError> {
        self.injected_failure(kind)?;
        let attributes = self.attributes(kind, id, properties);
        {
            let mut live = self.live.lock().unwrap();
            let resource = live
                .get_mut(id)
                .ok_or_else(|| BackendError::Permanent(format!("no resource with id {id}")))?;
            resource.attributes = attributes.clone();
        }
        debug!(kind = %kind, id = %id, "simulated update");
        self.calls.lock().unwrap().push(BackendCall::Update {
            kind: kind.clone(),
            id: id.to_string(),
        });
        Ok(attributes)
    }

    async fn delete_resource(&self, id: &str, kind: &ResourceKind) -> Result<(), BackendError> {
        self.injected_failure(kind)?;
        let removed = self.live.lock().unwrap().remove(id);
        if let Some(resource) = &removed {
            debug!(kind = %resource.kind, id = %id, "simulated delete");
        }
        self.calls.lock().unwrap().push(BackendCall::Delete {
            kind: kind.clone(),
            id: id.to_string(),
        });
        Ok(())
    }
}
