use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use stackwire_state::RemovalPolicy;

use super::value::Value;

/// What a logical resource is. The label is what the backend and the state
/// store see.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    SearchDomain,
    UserPool,
    UserPoolDomain,
    UserPoolUser,
    IdentityPool,
    IdentityPoolRoleAttachment,
    Role,
    ManagedPolicy,
    LogGroup,
    LogStream,
    Bucket,
    DeliveryStream,
    Function,
    EventRule,
    Permission,
    CustomResource,
    Generic(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::SearchDomain => "search.domain",
            ResourceKind::UserPool => "identity.user_pool",
            ResourceKind::UserPoolDomain => "identity.user_pool_domain",
            ResourceKind::UserPoolUser => "identity.user_pool_user",
            ResourceKind::IdentityPool => "identity.identity_pool",
            ResourceKind::IdentityPoolRoleAttachment => "identity.identity_pool_role_attachment",
            ResourceKind::Role => "iam.role",
            ResourceKind::ManagedPolicy => "iam.managed_policy",
            ResourceKind::LogGroup => "logs.log_group",
            ResourceKind::LogStream => "logs.log_stream",
            ResourceKind::Bucket => "storage.bucket",
            ResourceKind::DeliveryStream => "ingest.delivery_stream",
            ResourceKind::Function => "compute.function",
            ResourceKind::EventRule => "events.rule",
            ResourceKind::Permission => "compute.permission",
            ResourceKind::CustomResource => "custom.resource",
            ResourceKind::Generic(label) => label,
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "search.domain" => ResourceKind::SearchDomain,
            "identity.user_pool" => ResourceKind::UserPool,
            "identity.user_pool_domain" => ResourceKind::UserPoolDomain,
            "identity.user_pool_user" => ResourceKind::UserPoolUser,
            "identity.identity_pool" => ResourceKind::IdentityPool,
            "identity.identity_pool_role_attachment" => ResourceKind::IdentityPoolRoleAttachment,
            "iam.role" => ResourceKind::Role,
            "iam.managed_policy" => ResourceKind::ManagedPolicy,
            "logs.log_group" => ResourceKind::LogGroup,
            "logs.log_stream" => ResourceKind::LogStream,
            "storage.bucket" => ResourceKind::Bucket,
            "ingest.delivery_stream" => ResourceKind::DeliveryStream,
            "compute.function" => ResourceKind::Function,
            "events.rule" => ResourceKind::EventRule,
            "compute.permission" => ResourceKind::Permission,
            "custom.resource" => ResourceKind::CustomResource,
            other => ResourceKind::Generic(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ResourceKind {
    fn from(label: String) -> Self {
        ResourceKind::from_label(&label)
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

/// `group/id`, the unique address of a resource within a deployment.
pub fn address(group: &str, id: &str) -> String {
    format!("{group}/{id}")
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalResource {
    /// Unique within the owning group
    pub id: String,
    pub kind: ResourceKind,
    pub properties: BTreeMap<String, Value>,
    /// Explicit ordering edges to resources in the same group
    pub depends_on: BTreeSet<String>,
    pub removal_policy: RemovalPolicy,
}

impl LogicalResource {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            removal_policy: RemovalPolicy::Destroy,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, Value>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.removal_policy = policy;
        self
    }

    /// Reference to one of this resource's runtime attributes.
    pub fn attr(&self, attr: &str) -> Value {
        Value::attr(self.id.as_str(), attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        let kinds = [
            ResourceKind::SearchDomain,
            ResourceKind::UserPoolDomain,
            ResourceKind::IdentityPoolRoleAttachment,
            ResourceKind::Role,
            ResourceKind::LogStream,
            ResourceKind::DeliveryStream,
            ResourceKind::EventRule,
            ResourceKind::Permission,
            ResourceKind::CustomResource,
        ];
        for kind in kinds {
            assert_eq!(ResourceKind::from_label(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_label_is_generic() {
        let kind = ResourceKind::from_label("queue.fifo");
        assert_eq!(kind, ResourceKind::Generic("queue.fifo".into()));
        assert_eq!(kind.as_str(), "queue.fifo");
    }

    #[test]
    fn kind_serializes_as_label() {
        let json = serde_json::to_string(&ResourceKind::DeliveryStream).unwrap();
        assert_eq!(json, "\"ingest.delivery_stream\"");
    }
}
