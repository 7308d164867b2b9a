//! Event rules and invoke grants.
//!
//! An [`EventRule`] routes matching platform events to callback functions.
//! Each rule/target pair needs an [`InvokeGrant`] so that the event source
//! may call the target. Grants are scoped to the rule that issued them: the
//! statement id is derived from the rule name and the grant's source is that
//! rule's ARN, so a second rule targeting the same function gets a second,
//! distinct grant instead of reusing the first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{LogicalResource, ResourceKind, StackGroup, Value};

pub const INVOKE_ACTION: &str = "lambda:InvokeFunction";
pub const EVENTS_PRINCIPAL: &str = "events.amazonaws.com";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WiringError {
    #[error("event rule '{rule}' has an empty match pattern")]
    EmptyPattern { rule: String },

    #[error("event rule '{rule}' has no targets")]
    NoTargets { rule: String },

    #[error("event rule '{rule}' targets unknown function '{target}' in group '{group}'")]
    UnknownTarget {
        rule: String,
        target: String,
        group: String,
    },

    #[error("'{target}' is not a target of event rule '{rule}'")]
    NotATarget { rule: String, target: String },

    #[error(
        "statement id '{statement_id}' on '{target}' is already granted to rule \
         '{existing_rule}', cannot grant it to '{rule}'"
    )]
    GrantConflict {
        target: String,
        statement_id: String,
        existing_rule: String,
        rule: String,
    },

    #[error("event rule '{rule}' is declared twice in group '{group}'")]
    DuplicateRule { rule: String, group: String },

    #[error("invoke grant {address} could not be applied: {reason}")]
    GrantFailed { address: String, reason: String },
}

/// Which events a rule matches. Every non-empty field must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    pub source: Vec<String>,
    pub detail_type: Vec<String>,
    /// `detail` field -> accepted values
    pub detail: BTreeMap<String, Vec<String>>,
}

impl EventPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source.push(source.into());
        self
    }

    pub fn with_detail_type(mut self, detail_type: impl Into<String>) -> Self {
        self.detail_type.push(detail_type.into());
        self
    }

    pub fn with_detail<S: Into<String>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        self.detail
            .entry(field.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
            && self.detail_type.is_empty()
            && self.detail.values().all(Vec::is_empty)
    }

    pub fn to_value(&self) -> Value {
        let strings = |items: &[String]| Value::list(items.iter().map(|s| Value::lit(s.as_str())));
        let mut doc = BTreeMap::new();
        if !self.source.is_empty() {
            doc.insert("source".to_string(), strings(&self.source));
        }
        if !self.detail_type.is_empty() {
            doc.insert("detail-type".to_string(), strings(&self.detail_type));
        }
        if !self.detail.is_empty() {
            doc.insert(
                "detail".to_string(),
                Value::map(self.detail.iter().map(|(k, v)| (k.clone(), strings(v)))),
            );
        }
        Value::Map(doc)
    }
}

/// A function resource, by logical id in the rule's group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackTarget {
    pub function_id: String,
}

impl CallbackTarget {
    pub fn function(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
        }
    }

    pub fn arn(&self) -> Value {
        Value::attr(self.function_id.as_str(), "Arn")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRule {
    /// Logical id of the rule resource
    pub id: String,
    /// Physical rule name; also the basis of its grants' statement ids
    pub rule_name: String,
    pub description: Option<String>,
    pub pattern: EventPattern,
    pub targets: Vec<CallbackTarget>,
    pub enabled: bool,
}

/// Bind an event pattern to a callback target.
pub fn bind_rule(
    id: impl Into<String>,
    rule_name: impl Into<String>,
    pattern: EventPattern,
    target: CallbackTarget,
) -> EventRule {
    EventRule {
        id: id.into(),
        rule_name: rule_name.into(),
        description: None,
        pattern,
        targets: vec![target],
        enabled: true,
    }
}

impl EventRule {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_target(mut self, target: CallbackTarget) -> Self {
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn arn(&self) -> Value {
        Value::attr(self.id.as_str(), "Arn")
    }

    pub fn to_resource(&self) -> LogicalResource {
        let targets = self.targets.iter().map(|t| {
            Value::map([
                ("Id", Value::lit(t.function_id.as_str())),
                ("Arn", t.arn()),
            ])
        });
        let mut resource = LogicalResource::new(self.id.as_str(), ResourceKind::EventRule)
            .with_property("Name", self.rule_name.as_str())
            .with_property("EventPattern", self.pattern.to_value())
            .with_property("State", if self.enabled { "ENABLED" } else { "DISABLED" })
            .with_property("Targets", Value::list(targets));
        if let Some(description) = &self.description {
            resource = resource.with_property("Description", description.as_str());
        }
        resource
    }
}

/// Permission for one rule to invoke one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeGrant {
    pub statement_id: String,
    pub rule_id: String,
    pub target: CallbackTarget,
    pub action: String,
    pub principal: String,
}

impl InvokeGrant {
    /// Logical id of the permission resource backing this grant.
    pub fn resource_id(&self) -> String {
        format!("{}-invoke-{}", self.target.function_id, self.statement_id)
    }

    pub fn to_resource(&self) -> LogicalResource {
        LogicalResource::new(self.resource_id(), ResourceKind::Permission)
            .with_property("FunctionName", self.target.arn())
            .with_property("StatementId", self.statement_id.as_str())
            .with_property("Action", self.action.as_str())
            .with_property("Principal", self.principal.as_str())
            .with_property("SourceArn", Value::attr(self.rule_id.as_str(), "Arn"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Issued,
    AlreadyPresent,
}

/// Grants issued so far, keyed by target and statement id.
#[derive(Debug, Clone, Default)]
pub struct GrantRegistry {
    grants: BTreeMap<(CallbackTarget, String), InvokeGrant>,
}

impl GrantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement_id_for(rule: &EventRule) -> String {
        rule.rule_name.to_lowercase()
    }

    /// Allow `rule` to invoke `target`. Granting the same pair again is a
    /// no-op; a statement id already held by a different rule is an error.
    pub fn grant_invoke(
        &mut self,
        target: &CallbackTarget,
        rule: &EventRule,
    ) -> Result<GrantOutcome, WiringError> {
        if !rule.targets.contains(target) {
            return Err(WiringError::NotATarget {
                rule: rule.id.clone(),
                target: target.function_id.clone(),
            });
        }
        let statement_id = Self::statement_id_for(rule);
        let key = (target.clone(), statement_id.clone());
        if let Some(existing) = self.grants.get(&key) {
            if existing.rule_id == rule.id {
                return Ok(GrantOutcome::AlreadyPresent);
            }
            return Err(WiringError::GrantConflict {
                target: target.function_id.clone(),
                statement_id,
                existing_rule: existing.rule_id.clone(),
                rule: rule.id.clone(),
            });
        }
        crate::obs::emit_grant_issued(&target.function_id, &statement_id, &rule.id);
        self.grants.insert(
            key,
            InvokeGrant {
                statement_id,
                rule_id: rule.id.clone(),
                target: target.clone(),
                action: INVOKE_ACTION.to_string(),
                principal: EVENTS_PRINCIPAL.to_string(),
            },
        );
        Ok(GrantOutcome::Issued)
    }

    /// Remove the grant `rule` holds on `target`. Other rules' grants on the
    /// same target are untouched.
    pub fn revoke(&mut self, target: &CallbackTarget, rule: &EventRule) -> Option<InvokeGrant> {
        let key = (target.clone(), Self::statement_id_for(rule));
        match self.grants.get(&key) {
            Some(existing) if existing.rule_id == rule.id => self.grants.remove(&key),
            _ => None,
        }
    }

    pub fn grant(&self, target: &CallbackTarget, rule: &EventRule) -> Option<&InvokeGrant> {
        self.grants
            .get(&(target.clone(), Self::statement_id_for(rule)))
            .filter(|g| g.rule_id == rule.id)
    }

    pub fn grants_for(&self, target: &CallbackTarget) -> Vec<&InvokeGrant> {
        self.grants
            .values()
            .filter(|g| &g.target == target)
            .collect()
    }

    /// Whether events from `rule_id` may invoke `target`.
    pub fn permits(&self, target: &CallbackTarget, rule_id: &str) -> bool {
        self.grants
            .values()
            .any(|g| &g.target == target && g.rule_id == rule_id)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// Add `rule` and the permission resources for each of its targets to
/// `group`. Returns the grants issued by this call.
pub fn wire_rule(
    group: &mut StackGroup,
    registry: &mut GrantRegistry,
    rule: &EventRule,
) -> Result<Vec<InvokeGrant>, WiringError> {
    if rule.pattern.is_empty() {
        return Err(WiringError::EmptyPattern {
            rule: rule.id.clone(),
        });
    }
    if rule.targets.is_empty() {
        return Err(WiringError::NoTargets {
            rule: rule.id.clone(),
        });
    }
    for target in &rule.targets {
        let known = group
            .resource(&target.function_id)
            .is_some_and(|r| r.kind == ResourceKind::Function);
        if !known {
            return Err(WiringError::UnknownTarget {
                rule: rule.id.clone(),
                target: target.function_id.clone(),
                group: group.id.clone(),
            });
        }
    }
    group
        .add_resource(rule.to_resource())
        .map_err(|_| WiringError::DuplicateRule {
            rule: rule.id.clone(),
            group: group.id.clone(),
        })?;

    let mut issued = Vec::new();
    for target in &rule.targets {
        if registry.grant_invoke(target, rule)? == GrantOutcome::Issued {
            if let Some(grant) = registry.grant(target, rule) {
                group
                    .add_resource(grant.to_resource())
                    .map_err(|_| WiringError::DuplicateRule {
                        rule: rule.id.clone(),
                        group: group.id.clone(),
                    })?;
                issued.push(grant.clone());
            }
        }
    }
    Ok(issued)
}
