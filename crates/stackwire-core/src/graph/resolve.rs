use std::collections::{BTreeMap, HashMap};

use super::error::PlanError;
use super::resource::address;
use super::value::{Scalar, Value};
use crate::params::ResolvedParameters;

/// Fully resolved resource properties as handed to a backend.
pub type ResolvedProperties = BTreeMap<String, serde_json::Value>;

/// Everything known at the moment a resource is applied.
pub struct ResolutionScope<'a> {
    /// Address (or output path) being resolved, used in errors
    pub origin: &'a str,
    /// Group that owns the value; attribute references resolve inside it
    pub group: &'a str,
    pub params: &'a ResolvedParameters,
    /// Attributes of settled resources, by address
    pub attributes: &'a HashMap<String, BTreeMap<String, String>>,
    /// Published output snapshots, by group
    pub outputs: &'a BTreeMap<String, BTreeMap<String, String>>,
}

impl ResolutionScope<'_> {
    pub fn resolve(&self, value: &Value) -> Result<serde_json::Value, PlanError> {
        match value {
            Value::Literal(s) => Ok(s.to_json()),
            Value::ParameterRef(name) => self
                .params
                .get(name)
                .map(Scalar::to_json)
                .ok_or_else(|| PlanError::UnknownParameter {
                    resource: self.origin.to_string(),
                    name: name.clone(),
                }),
            Value::DeferredAttribute { resource_id, attr } => {
                let target = address(self.group, resource_id);
                self.attributes
                    .get(&target)
                    .and_then(|attrs| attrs.get(attr))
                    .map(|v| serde_json::Value::String(v.clone()))
                    .ok_or_else(|| PlanError::DanglingReference {
                        resource: self.origin.to_string(),
                        target: format!("{target}.{attr}"),
                    })
            }
            Value::Output { group, name } => self
                .outputs
                .get(group)
                .and_then(|outputs| outputs.get(name))
                .map(|v| serde_json::Value::String(v.clone()))
                .ok_or_else(|| PlanError::DanglingReference {
                    resource: self.origin.to_string(),
                    target: format!("{group}.{name}"),
                }),
            Value::Join(parts) => {
                let mut joined = String::new();
                for part in parts {
                    let resolved = self.resolve(part)?;
                    let scalar = Scalar::from_json(&resolved).ok_or_else(|| PlanError::InvalidValue {
                        resource: self.origin.to_string(),
                        reason: "joined values must be scalars".to_string(),
                    })?;
                    joined.push_str(&scalar.to_string());
                }
                Ok(serde_json::Value::String(joined))
            }
            Value::List(items) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve(item))
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(entries) => Ok(serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                    .collect::<Result<_, PlanError>>()?,
            )),
        }
    }

    pub fn resolve_properties(
        &self,
        properties: &BTreeMap<String, Value>,
    ) -> Result<ResolvedProperties, PlanError> {
        properties
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
            .collect()
    }
}

/// Render a resolved value as an output string.
pub fn output_string(value: &serde_json::Value) -> String {
    match Scalar::from_json(value) {
        Some(scalar) => scalar.to_string(),
        None => value.to_string(),
    }
}
