//! Permission statements and roles.

pub mod role;
pub mod statement;

pub use role::{build_role, LintWarning, Role};
pub use statement::{Effect, PolicyStatement, Principal};
