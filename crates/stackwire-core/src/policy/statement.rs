use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// Who a statement or trust relationship applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    /// A service principal such as `lambda.amazonaws.com`
    Service { service: String },
    /// A specific identity, possibly only known after provisioning
    Arn { arn: Value },
    /// Federated identity with `operator -> key -> value` conditions
    WebIdentity {
        provider: String,
        conditions: BTreeMap<String, BTreeMap<String, Value>>,
    },
    Any,
}

impl Principal {
    pub fn service(service: impl Into<String>) -> Self {
        Principal::Service {
            service: service.into(),
        }
    }

    pub fn arn(arn: impl Into<Value>) -> Self {
        Principal::Arn { arn: arn.into() }
    }

    pub fn web_identity(provider: impl Into<String>) -> Self {
        Principal::WebIdentity {
            provider: provider.into(),
            conditions: BTreeMap::new(),
        }
    }

    /// Add a condition. Only meaningful for web-identity principals; other
    /// principals are returned unchanged.
    pub fn with_condition(
        mut self,
        operator: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        if let Principal::WebIdentity { conditions, .. } = &mut self {
            conditions
                .entry(operator.into())
                .or_default()
                .insert(key.into(), value.into());
        }
        self
    }

    pub fn to_value(&self) -> Value {
        match self {
            Principal::Service { service } => {
                Value::map([("Service", Value::lit(service.as_str()))])
            }
            Principal::Arn { arn } => Value::map([("AWS", arn.clone())]),
            Principal::WebIdentity { provider, .. } => {
                Value::map([("Federated", Value::lit(provider.as_str()))])
            }
            Principal::Any => Value::lit("*"),
        }
    }

    /// Action used in a trust policy for this principal.
    pub fn assume_action(&self) -> &'static str {
        match self {
            Principal::WebIdentity { .. } => "sts:AssumeRoleWithWebIdentity",
            _ => "sts:AssumeRole",
        }
    }

    fn conditions_value(&self) -> Option<Value> {
        match self {
            Principal::WebIdentity { conditions, .. } if !conditions.is_empty() => Some(
                Value::map(conditions.iter().map(|(op, entries)| {
                    (
                        op.clone(),
                        Value::map(entries.iter().map(|(k, v)| (k.clone(), v.clone()))),
                    )
                })),
            ),
            _ => None,
        }
    }
}

/// One permission statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub sid: Option<String>,
    pub effect: Effect,
    pub actions: Vec<String>,
    pub resources: Vec<Value>,
    pub principal: Option<Principal>,
}

impl PolicyStatement {
    pub fn allow() -> Self {
        Self {
            sid: None,
            effect: Effect::Allow,
            actions: Vec::new(),
            resources: Vec::new(),
            principal: None,
        }
    }

    pub fn deny() -> Self {
        Self {
            effect: Effect::Deny,
            ..Self::allow()
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        let action = action.into();
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
        self
    }

    pub fn with_actions<S: Into<String>>(self, actions: impl IntoIterator<Item = S>) -> Self {
        actions.into_iter().fold(self, |s, a| s.with_action(a))
    }

    pub fn with_resource(mut self, resource: impl Into<Value>) -> Self {
        let resource = resource.into();
        if !self.resources.contains(&resource) {
            self.resources.push(resource);
        }
        self
    }

    pub fn with_resources<V: Into<Value>>(self, resources: impl IntoIterator<Item = V>) -> Self {
        resources.into_iter().fold(self, |s, r| s.with_resource(r))
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// A wildcard action on a wildcard resource.
    pub fn is_overly_broad(&self) -> bool {
        self.effect == Effect::Allow
            && self.resources.iter().any(Value::is_wildcard)
            && self.actions.iter().any(|a| a.contains('*'))
    }

    pub fn to_value(&self) -> Value {
        let mut doc = BTreeMap::new();
        if let Some(sid) = &self.sid {
            doc.insert("Sid".to_string(), Value::lit(sid.as_str()));
        }
        let effect = match self.effect {
            Effect::Allow => "Allow",
            Effect::Deny => "Deny",
        };
        doc.insert("Effect".to_string(), Value::lit(effect));
        doc.insert(
            "Action".to_string(),
            Value::list(self.actions.iter().map(|a| Value::lit(a.as_str()))),
        );
        if !self.resources.is_empty() {
            doc.insert("Resource".to_string(), Value::List(self.resources.clone()));
        }
        if let Some(principal) = &self.principal {
            doc.insert("Principal".to_string(), principal.to_value());
            if let Some(conditions) = principal.conditions_value() {
                doc.insert("Condition".to_string(), conditions);
            }
        }
        Value::Map(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_action_on_wildcard_resource_is_broad() {
        let s = PolicyStatement::allow()
            .with_action("es:*")
            .with_resource("*");
        assert!(s.is_overly_broad());
    }

    #[test]
    fn wildcard_action_on_scoped_resource_is_not_broad() {
        let s = PolicyStatement::allow()
            .with_action("es:ESHttp*")
            .with_resource("arn:aws:es:us-east-1:123456789012:domain/waf/*");
        assert!(!s.is_overly_broad());
    }

    #[test]
    fn actions_and_resources_deduplicate() {
        let s = PolicyStatement::allow()
            .with_actions(["s3:GetObject", "s3:GetObject"])
            .with_resources(["a", "a", "b"]);
        assert_eq!(s.actions.len(), 1);
        assert_eq!(s.resources.len(), 2);
    }

    #[test]
    fn web_identity_conditions_render() {
        let p = Principal::web_identity("cognito-identity.amazonaws.com")
            .with_condition("StringEquals", "cognito-identity.amazonaws.com:aud", "pool-1")
            .with_condition(
                "ForAnyValue:StringLike",
                "cognito-identity.amazonaws.com:amr",
                "authenticated",
            );
        let s = PolicyStatement::allow()
            .with_action(p.assume_action())
            .with_principal(p);
        let Value::Map(doc) = s.to_value() else {
            panic!("statement renders as a map");
        };
        assert!(doc.contains_key("Condition"));
        assert_eq!(
            doc["Action"],
            Value::list([Value::lit("sts:AssumeRoleWithWebIdentity")])
        );
    }
}
