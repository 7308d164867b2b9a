//! Physical names and ARNs.
//!
//! Physical names are `prefix + logical_name + token`, where the token is
//! generated once per deployment and persisted, so names stay stable across
//! redeploys while differing between deployments.

use serde::{Deserialize, Serialize};
use stackwire_state::{DeploymentId, StateStore};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::DeployConfig;
use crate::error::DeployResult;
use crate::graph::Value;

/// Length of a generated uniqueness token.
pub const TOKEN_LEN: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("invalid ARN {component} '{value}': {reason}")]
    InvalidArnComponent {
        component: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid uniqueness token '{token}'")]
    InvalidToken { token: String },
}

/// Per-deployment random suffix for physical names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniquenessToken(String);

impl UniquenessToken {
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..TOKEN_LEN].to_string())
    }

    /// Accept a previously persisted token.
    pub fn parse(token: impl Into<String>) -> Result<Self, NamingError> {
        let token = token.into();
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !valid {
            return Err(NamingError::InvalidToken { token });
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UniquenessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive a physical name. Deterministic in its three inputs.
pub fn resolve(prefix: &str, logical_name: &str, token: &UniquenessToken) -> String {
    format!("{prefix}{logical_name}{token}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArnSeparator {
    #[default]
    Slash,
    Colon,
}

impl ArnSeparator {
    fn as_char(self) -> char {
        match self {
            ArnSeparator::Slash => '/',
            ArnSeparator::Colon => ':',
        }
    }
}

/// Components of `arn:partition:service:region:account:type[/|:]name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArnComponents {
    pub partition: String,
    pub service: String,
    /// Empty for global services
    pub region: String,
    /// Empty for services whose ARNs omit the account
    pub account: String,
    pub resource_type: String,
    pub resource_name: Option<String>,
    pub separator: ArnSeparator,
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
}

fn check(
    component: &'static str,
    value: &str,
    allow_empty: bool,
    valid: impl Fn(&str) -> bool,
    reason: &'static str,
) -> Result<(), NamingError> {
    if value.is_empty() && allow_empty {
        return Ok(());
    }
    if value.is_empty() || !valid(value) {
        return Err(NamingError::InvalidArnComponent {
            component,
            value: value.to_string(),
            reason,
        });
    }
    Ok(())
}

/// Format an ARN, rejecting malformed components.
pub fn format_arn(c: &ArnComponents) -> Result<String, NamingError> {
    let token = |s: &str| s.chars().all(is_token_char);
    let no_space = |s: &str| !s.chars().any(char::is_whitespace);
    check("partition", &c.partition, false, token, "must be lowercase alphanumeric or '-'")?;
    check("service", &c.service, false, token, "must be lowercase alphanumeric or '-'")?;
    check("region", &c.region, true, token, "must be lowercase alphanumeric or '-'")?;
    check(
        "account",
        &c.account,
        true,
        |s| s.len() == 12 && s.chars().all(|ch| ch.is_ascii_digit()),
        "must be 12 digits",
    )?;
    check("resource type", &c.resource_type, false, no_space, "must not contain whitespace")?;
    let mut arn = format!(
        "arn:{}:{}:{}:{}:{}",
        c.partition, c.service, c.region, c.account, c.resource_type
    );
    if let Some(name) = &c.resource_name {
        check("resource name", name, false, no_space, "must not contain whitespace")?;
        arn.push(c.separator.as_char());
        arn.push_str(name);
    }
    Ok(arn)
}

/// Naming inputs for one deployment: where it runs and its persisted token.
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    pub deployment_id: DeploymentId,
    pub token: UniquenessToken,
    pub prefix: String,
    pub partition: String,
    pub region: String,
    pub account: String,
}

impl DeploymentContext {
    pub fn new(deployment_id: DeploymentId, token: UniquenessToken, config: &DeployConfig) -> Self {
        Self {
            deployment_id,
            token,
            prefix: config.prefix.clone(),
            partition: config.partition.clone(),
            region: config.region.clone(),
            account: config.account.clone(),
        }
    }

    /// Load the deployment's token from the store, generating and persisting
    /// one on first use.
    pub async fn load_or_init(
        store: &dyn StateStore,
        deployment_id: DeploymentId,
        config: &DeployConfig,
    ) -> DeployResult<Self> {
        let candidate = UniquenessToken::generate();
        let stored = store.init_token(&deployment_id, candidate.as_str()).await?;
        let token = UniquenessToken::parse(stored)?;
        debug!(deployment = %deployment_id, token = %token, "uniqueness token loaded");
        Ok(Self::new(deployment_id, token, config))
    }

    pub fn resolve_name(&self, logical_name: &str) -> String {
        resolve(&self.prefix, logical_name, &self.token)
    }

    fn components(&self, service: &str, resource_type: &str) -> ArnComponents {
        ArnComponents {
            partition: self.partition.clone(),
            service: service.to_string(),
            region: self.region.clone(),
            account: self.account.clone(),
            resource_type: resource_type.to_string(),
            resource_name: None,
            separator: ArnSeparator::Slash,
        }
    }

    /// Regional ARN in this deployment's partition, region and account.
    pub fn arn(
        &self,
        service: &str,
        resource_type: &str,
        resource_name: Option<&str>,
        separator: ArnSeparator,
    ) -> Result<String, NamingError> {
        format_arn(&ArnComponents {
            resource_name: resource_name.map(str::to_string),
            separator,
            ..self.components(service, resource_type)
        })
    }

    /// ARN whose resource name is only known at plan or apply time.
    pub fn arn_value(
        &self,
        service: &str,
        resource_type: &str,
        resource_name: Value,
    ) -> Result<Value, NamingError> {
        let head = format_arn(&self.components(service, resource_type))?;
        Ok(Value::join([Value::lit(format!("{head}/")), resource_name]))
    }
}
