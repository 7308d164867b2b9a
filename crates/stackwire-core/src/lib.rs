//! stackwire Core Library
//!
//! Declarative resource-graph composition, event wiring and the
//! custom-resource lifecycle, plus the executor that applies a plan
//! against a provisioning backend.

pub mod backend;
pub mod blueprint;
pub mod config;
pub mod custom_resource;
pub mod error;
pub mod executor;
pub mod graph;
pub mod metrics;
pub mod naming;
pub mod obs;
pub mod params;
pub mod policy;
pub mod recording;
pub mod retry;
pub mod telemetry;
pub mod wiring;

pub use backend::{
    BackendCall, BackendError, ProvisionedResource, ProvisioningBackend, SimulatedBackend,
};

pub use config::{ConfigError, DeployConfig};

pub use custom_resource::{
    custom_resource, CallbackHandler, ControllerConfig, CustomResourceInvocation, HandlerError,
    HandlerRequest, HandlerResponse, HttpCallbackHandler, HttpHandlerConfig, LifecycleController,
    LifecycleState, LocalHandler, ReplacementError, RequestType, ResponseStatus, TransitionError,
    TransitionOutcome, SERVICE_TOKEN,
};

pub use error::{DeployError, DeployResult};

pub use executor::{
    CancelHandle, DeployReport, Deployment, ExecutorConfig, NodeAction, NodeFailure,
};

pub use graph::{
    Composer, DeployPlan, GroupPlan, LogicalResource, PlanError, PlanStep, ResourceKind, Scalar,
    StackGroup, Value,
};

pub use naming::{
    format_arn, resolve, ArnComponents, ArnSeparator, DeploymentContext, NamingError,
    UniquenessToken,
};

pub use params::{parse_override, ParamType, Parameter, ParameterStore, ResolvedParameters};

pub use policy::{build_role, Effect, LintWarning, PolicyStatement, Principal, Role};

pub use recording::DeployRunRecorder;

pub use retry::RetryPolicy;

pub use telemetry::init_tracing;

pub use wiring::{
    bind_rule, wire_rule, CallbackTarget, EventPattern, EventRule, GrantOutcome, GrantRegistry,
    InvokeGrant, WiringError,
};
