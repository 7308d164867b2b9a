//! Structured observability hooks for deploy lifecycle events.
//!
//! This module provides:
//! - Deployment-scoped tracing spans via the `DeploySpan` RAII guard
//! - Emission functions for key lifecycle events: deploy start and finish,
//!   resource settle and failure, custom-resource transitions, invoke grants
//!
//! Events are emitted at `info!` level (failures at `warn!`) with an
//! `event` field naming the lifecycle point.

use tracing::{info, warn};

/// RAII guard that enters a deployment-scoped span for the duration of a run.
///
/// ```ignore
/// let _span = DeploySpan::enter("dashboards", "deploy");
/// // tracing calls below carry deployment = "dashboards"
/// ```
pub struct DeploySpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploySpan {
    pub fn enter(deployment: &str, action: &str) -> Self {
        let span = tracing::info_span!("stackwire.deploy", deployment = %deployment, action = %action);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_deploy_started(deployment: &str, run_id: &str, steps: usize) {
    info!(event = "deploy.started", deployment = %deployment, run_id = %run_id, steps = steps);
}

pub fn emit_deploy_finished(
    deployment: &str,
    run_id: &str,
    duration_ms: u64,
    settled: usize,
    failed: usize,
    success: bool,
) {
    info!(
        event = "deploy.finished",
        deployment = %deployment,
        run_id = %run_id,
        duration_ms = duration_ms,
        settled = settled,
        failed = failed,
        success = success,
    );
}

pub fn emit_resource_settled(address: &str, action: &str) {
    info!(event = "resource.settled", address = %address, action = %action);
}

pub fn emit_resource_failed(address: &str, error: &dyn std::fmt::Display) {
    warn!(event = "resource.failed", address = %address, error = %error);
}

pub fn emit_resource_skipped(address: &str, cause: &str) {
    warn!(event = "resource.skipped", address = %address, cause = %cause);
}

pub fn emit_transition(address: &str, request_type: &str, physical_id: &str) {
    info!(
        event = "custom_resource.transition",
        address = %address,
        request_type = %request_type,
        physical_id = %physical_id,
    );
}

pub fn emit_grant_issued(target: &str, statement_id: &str, rule: &str) {
    info!(event = "grant.issued", target = %target, statement_id = %statement_id, rule = %rule);
}

pub fn emit_outputs_published(group: &str, count: usize) {
    info!(event = "group.outputs_published", group = %group, count = count);
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_guard_can_be_nested() {
        let _outer = DeploySpan::enter("dashboards", "deploy");
        let _inner = DeploySpan::enter("dashboards", "destroy");
        emit_resource_settled("search/domain", "created");
    }

    #[test]
    fn emitters_do_not_panic_without_subscriber() {
        emit_deploy_started("dashboards", "run-1", 3);
        emit_transition("app/customizer", "CREATE", "phys-1");
        emit_grant_issued("updater", "detect", "r1");
        emit_resource_failed("app/x", &"boom");
        emit_deploy_finished("dashboards", "run-1", 12, 3, 0, true);
    }
}
