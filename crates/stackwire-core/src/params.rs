//! Deployment parameters.
//!
//! Parameters are declared by stack groups with a type, a default and
//! optional constraints. Operators override them per deployment; every
//! value, default or override, is validated before planning continues.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::graph::{PlanError, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
}

/// A declared deployment parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParamType,
    /// Raw default, validated like an override
    pub default_value: String,
    pub description: String,
    /// Full-match regular expression for string parameters
    #[serde(default)]
    pub allowed_pattern: Option<String>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub lowercase_only: bool,
}

impl Parameter {
    pub fn string(
        name: impl Into<String>,
        default_value: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: ParamType::String,
            default_value: default_value.into(),
            description: description.into(),
            allowed_pattern: None,
            min_value: None,
            max_value: None,
            lowercase_only: false,
        }
    }

    pub fn number(name: impl Into<String>, default_value: f64, description: impl Into<String>) -> Self {
        Self {
            param_type: ParamType::Number,
            ..Self::string(name, Scalar::Number(default_value).to_string(), description)
        }
    }

    pub fn with_allowed_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_pattern = Some(pattern.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn lowercase_only(mut self) -> Self {
        self.lowercase_only = true;
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> PlanError {
        PlanError::InvalidParameter {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Validate a raw value against this parameter's type and constraints.
    pub fn validate(&self, raw: &str) -> Result<Scalar, PlanError> {
        match self.param_type {
            ParamType::Number => {
                let n: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| self.invalid(format!("'{raw}' is not a number")))?;
                if !n.is_finite() {
                    return Err(self.invalid(format!("'{raw}' is not a finite number")));
                }
                if let Some(min) = self.min_value {
                    if n < min {
                        return Err(self.invalid(format!("{n} is below the minimum {min}")));
                    }
                }
                if let Some(max) = self.max_value {
                    if n > max {
                        return Err(self.invalid(format!("{n} is above the maximum {max}")));
                    }
                }
                Ok(Scalar::Number(n))
            }
            ParamType::String => {
                if self.lowercase_only && raw.chars().any(char::is_uppercase) {
                    return Err(self.invalid(format!("'{raw}' must be lowercase")));
                }
                if let Some(pattern) = &self.allowed_pattern {
                    let re = Regex::new(&format!("^(?:{pattern})$"))
                        .map_err(|e| self.invalid(format!("bad allowed pattern: {e}")))?;
                    if !re.is_match(raw) {
                        return Err(self.invalid(format!("'{raw}' does not match {pattern}")));
                    }
                }
                Ok(Scalar::String(raw.to_string()))
            }
        }
    }
}

/// Validated parameter values, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedParameters(BTreeMap<String, Scalar>);

impl ResolvedParameters {
    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Declared parameters plus operator overrides.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    declared: Vec<Parameter>,
    overrides: BTreeMap<String, String>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, parameter: Parameter) -> Result<(), PlanError> {
        if self.get(&parameter.name).is_some() {
            return Err(PlanError::InvalidParameter {
                name: parameter.name,
                reason: "declared more than once".to_string(),
            });
        }
        self.declared.push(parameter);
        Ok(())
    }

    pub fn set_override(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.overrides.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.declared.iter().find(|p| p.name == name)
    }

    pub fn declared(&self) -> &[Parameter] {
        &self.declared
    }

    /// Validate every declared parameter, applying overrides.
    ///
    /// An override naming an undeclared parameter is an error.
    pub fn resolve(&self) -> Result<ResolvedParameters, PlanError> {
        if let Some(unknown) = self.overrides.keys().find(|name| self.get(name).is_none()) {
            return Err(PlanError::InvalidParameter {
                name: unknown.clone(),
                reason: "no such parameter is declared".to_string(),
            });
        }
        let mut values = BTreeMap::new();
        for parameter in &self.declared {
            let raw = self
                .overrides
                .get(&parameter.name)
                .unwrap_or(&parameter.default_value);
            values.insert(parameter.name.clone(), parameter.validate(raw)?);
        }
        Ok(ResolvedParameters(values))
    }
}

/// Parse a `name=value` override as given on the command line.
pub fn parse_override(raw: &str) -> Result<(String, String), PlanError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(PlanError::InvalidParameter {
            name: raw.to_string(),
            reason: "expected name=value".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store
            .declare(Parameter::number("dataNodeEBSVolumeSize", 10.0, "EBS size in GiB").with_range(10.0, 1024.0))
            .unwrap();
        store
            .declare(
                Parameter::string("cognitoDomainName", "os-waf-dashboard-domain", "Cognito domain")
                    .lowercase_only()
                    .with_allowed_pattern("[a-z0-9-]+"),
            )
            .unwrap();
        store
    }

    #[test]
    fn defaults_resolve() {
        let resolved = store().resolve().unwrap();
        assert_eq!(
            resolved.get("dataNodeEBSVolumeSize"),
            Some(&Scalar::Number(10.0))
        );
        assert_eq!(
            resolved.get("cognitoDomainName"),
            Some(&Scalar::String("os-waf-dashboard-domain".into()))
        );
    }

    #[test]
    fn override_replaces_default() {
        let mut store = store();
        store.set_override("dataNodeEBSVolumeSize", "20");
        let resolved = store.resolve().unwrap();
        assert_eq!(
            resolved.get("dataNodeEBSVolumeSize"),
            Some(&Scalar::Number(20.0))
        );
    }

    #[test]
    fn uppercase_rejected_for_lowercase_only() {
        let mut store = store();
        store.set_override("cognitoDomainName", "My-Domain");
        let err = store.resolve().unwrap_err();
        assert!(matches!(err, PlanError::InvalidParameter { ref name, .. } if name == "cognitoDomainName"));
    }

    #[test]
    fn non_numeric_and_out_of_range_rejected() {
        let mut s = store();
        s.set_override("dataNodeEBSVolumeSize", "ten");
        assert!(s.resolve().is_err());

        let mut s = store();
        s.set_override("dataNodeEBSVolumeSize", "5");
        assert!(s.resolve().is_err());
    }

    #[test]
    fn unknown_override_rejected() {
        let mut s = store();
        s.set_override("nope", "1");
        let err = s.resolve().unwrap_err();
        assert!(matches!(err, PlanError::InvalidParameter { ref name, .. } if name == "nope"));
    }

    #[test]
    fn duplicate_declaration_rejected() {
        let mut s = store();
        assert!(s
            .declare(Parameter::string("cognitoDomainName", "x", ""))
            .is_err());
    }

    #[test]
    fn parse_override_splits_on_first_equals() {
        assert_eq!(
            parse_override("nodeType=r6g.large").unwrap(),
            ("nodeType".to_string(), "r6g.large".to_string())
        );
        assert_eq!(
            parse_override("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_override("novalue").is_err());
    }
}
