use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::statement::{PolicyStatement, Principal};
use crate::graph::Value;

/// An identity assumable by a trusted principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: Value,
    pub description: Option<String>,
    pub trust_principal: Principal,
    pub statements: Vec<PolicyStatement>,
    pub managed_policy_arns: Vec<Value>,
    pub max_session_duration_secs: Option<u32>,
}

/// Advisory finding from [`Role::lint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintWarning {
    pub role: String,
    pub statement: String,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role {} statement {}: {}", self.role, self.statement, self.message)
    }
}

/// Build a role from its trust principal and permission statements.
/// Identical statements are kept once.
pub fn build_role(
    name: impl Into<Value>,
    trust_principal: Principal,
    statements: impl IntoIterator<Item = PolicyStatement>,
) -> Role {
    let mut role = Role {
        name: name.into(),
        description: None,
        trust_principal,
        statements: Vec::new(),
        managed_policy_arns: Vec::new(),
        max_session_duration_secs: None,
    };
    for statement in statements {
        role = role.with_statement(statement);
    }
    role
}

impl Role {
    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        if !self.statements.contains(&statement) {
            self.statements.push(statement);
        }
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_managed_policy(mut self, arn: impl Into<Value>) -> Self {
        let arn = arn.into();
        if !self.managed_policy_arns.contains(&arn) {
            self.managed_policy_arns.push(arn);
        }
        self
    }

    pub fn with_max_session_duration(mut self, secs: u32) -> Self {
        self.max_session_duration_secs = Some(secs);
        self
    }

    fn display_name(&self) -> String {
        match &self.name {
            Value::Literal(s) => s.to_string(),
            Value::ParameterRef(p) => format!("${p}"),
            other => format!("{other:?}"),
        }
    }

    /// Flag statements that grant wildcard actions on wildcard resources.
    /// Findings are advisory; the role is still valid.
    pub fn lint(&self) -> Vec<LintWarning> {
        self.statements
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_overly_broad())
            .map(|(i, s)| LintWarning {
                role: self.display_name(),
                statement: s.sid.clone().unwrap_or_else(|| format!("#{i}")),
                message: format!(
                    "grants {} on every resource",
                    s.actions.join(", ")
                ),
            })
            .collect()
    }

    pub fn trust_policy(&self) -> Value {
        let statement = PolicyStatement::allow()
            .with_action(self.trust_principal.assume_action())
            .with_principal(self.trust_principal.clone());
        Value::map([
            ("Version", Value::lit("2012-10-17")),
            ("Statement", Value::list([statement.to_value()])),
        ])
    }

    /// Properties of the role as a provisioned resource.
    pub fn to_properties(&self) -> BTreeMap<String, Value> {
        let mut props = BTreeMap::new();
        props.insert("RoleName".to_string(), self.name.clone());
        props.insert("AssumeRolePolicyDocument".to_string(), self.trust_policy());
        if let Some(description) = &self.description {
            props.insert("Description".to_string(), Value::lit(description.as_str()));
        }
        if !self.statements.is_empty() {
            props.insert(
                "Policies".to_string(),
                Value::map([(
                    "Statement",
                    Value::list(self.statements.iter().map(PolicyStatement::to_value)),
                )]),
            );
        }
        if !self.managed_policy_arns.is_empty() {
            props.insert(
                "ManagedPolicyArns".to_string(),
                Value::List(self.managed_policy_arns.clone()),
            );
        }
        if let Some(secs) = self.max_session_duration_secs {
            props.insert("MaxSessionDuration".to_string(), Value::lit(secs));
        }
        props
    }
}
