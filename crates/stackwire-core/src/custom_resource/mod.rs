//! Custom resources: user-supplied handlers driven through a
//! create / update / delete lifecycle.

mod controller;
mod error;
mod handler;
mod http;
mod lease;
mod local;
mod protocol;

pub use controller::{
    ControllerConfig, CustomResourceInvocation, LifecycleController, LifecycleState,
    TransitionOutcome,
};
pub use error::{ReplacementError, TransitionError};
pub use handler::{CallbackHandler, HandlerError};
pub use http::{HttpCallbackHandler, HttpHandlerConfig, HANDLER_HEADER};
pub use lease::{Lease, LeaseTable};
pub use local::LocalHandler;
pub use protocol::{HandlerRequest, HandlerResponse, RequestType, ResponseStatus};

use crate::graph::{LogicalResource, ResourceKind, Value};

/// Property naming the handler that serves a custom resource.
pub const SERVICE_TOKEN: &str = "ServiceToken";

/// A custom resource served by `handler_ref`, usually a function's `Arn`
/// attribute.
pub fn custom_resource(id: impl Into<String>, handler_ref: impl Into<Value>) -> LogicalResource {
    LogicalResource::new(id, ResourceKind::CustomResource).with_property(SERVICE_TOKEN, handler_ref)
}
