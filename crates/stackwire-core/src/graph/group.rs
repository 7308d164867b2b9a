use std::collections::BTreeMap;

use super::error::PlanError;
use super::resource::{LogicalResource, ResourceKind};
use super::value::Value;
use crate::params::Parameter;
use crate::policy::{LintWarning, Role};

/// A named, optionally nested collection of resources that settles as a
/// unit and exposes outputs to other groups.
#[derive(Debug, Clone, Default)]
pub struct StackGroup {
    pub id: String,
    pub parent: Option<String>,
    resources: Vec<LogicalResource>,
    parameters: Vec<Parameter>,
    outputs: BTreeMap<String, Value>,
    roles: Vec<(String, Role)>,
}

impl StackGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn nested_under(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn add_resource(&mut self, resource: LogicalResource) -> Result<(), PlanError> {
        if self.resource(&resource.id).is_some() {
            return Err(PlanError::DuplicateResource {
                group: self.id.clone(),
                id: resource.id,
            });
        }
        self.resources.push(resource);
        Ok(())
    }

    /// Add a role as a resource; its statements are linted during planning.
    pub fn add_role(&mut self, id: impl Into<String>, role: Role) -> Result<(), PlanError> {
        let id = id.into();
        self.add_resource(
            LogicalResource::new(id.clone(), ResourceKind::Role).with_properties(role.to_properties()),
        )?;
        self.roles.push((id, role));
        Ok(())
    }

    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    pub fn add_output(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(name.into(), value.into());
    }

    pub fn resource(&self, id: &str) -> Option<&LogicalResource> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> &[LogicalResource] {
        &self.resources
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &Role)> {
        self.roles.iter().map(|(id, role)| (id.as_str(), role))
    }

    pub fn lint(&self) -> Vec<LintWarning> {
        self.roles.iter().flat_map(|(_, role)| role.lint()).collect()
    }
}
