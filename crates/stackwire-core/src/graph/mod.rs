//! Resource graph: values, resources, stack groups and plan composition.

pub mod composer;
pub mod error;
pub mod group;
pub mod plan;
pub mod resolve;
pub mod resource;
pub mod value;

pub use composer::Composer;
pub use error::PlanError;
pub use group::StackGroup;
pub use plan::{DeployPlan, GroupPlan, PlanStep};
pub use resolve::{output_string, ResolutionScope, ResolvedProperties};
pub use resource::{address, LogicalResource, ResourceKind};
pub use value::{Reference, Scalar, Value};
