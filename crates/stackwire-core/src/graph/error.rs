use thiserror::Error;

use crate::naming::NamingError;

/// Errors raised while composing a definition into a deploy plan, and while
/// resolving values against it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// Members are listed in cycle order
    #[error("cyclic dependency among: {}", members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    #[error("{resource} references {target}, which is never materialized")]
    DanglingReference { resource: String, target: String },

    #[error(
        "{resource} references {target} owned by group '{owner}'; \
         cross-group values must be consumed through outputs"
    )]
    OwnershipViolation {
        resource: String,
        target: String,
        owner: String,
    },

    #[error("duplicate resource id '{id}' in group '{group}'")]
    DuplicateResource { group: String, id: String },

    #[error("duplicate stack group '{group}'")]
    DuplicateGroup { group: String },

    #[error("group '{group}' is nested under unknown group '{parent}'")]
    UnknownParent { group: String, parent: String },

    #[error("group nesting forms a cycle through '{group}'")]
    NestingCycle { group: String },

    #[error("{resource} references undeclared parameter '{name}'")]
    UnknownParameter { resource: String, name: String },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("property '{property}' of {resource} must resolve to a scalar")]
    NonScalarProperty { resource: String, property: String },

    #[error("{resource}: {reason}")]
    InvalidValue { resource: String, reason: String },

    #[error(transparent)]
    Naming(#[from] NamingError),
}
