//! End-to-end deploys of the dashboards blueprint against the simulated
//! backend, with state persisted to disk between runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use stackwire_core::blueprint::{self, APP_GROUP, SEARCH_GROUP};
use stackwire_core::{
    ControllerConfig, DeployConfig, DeployPlan, Deployment, DeploymentContext, ExecutorConfig,
    GrantRegistry, LifecycleController, LocalHandler, NodeAction, SimulatedBackend,
};
use stackwire_state::fakes::MemoryDeployLedger;
use stackwire_state::{DeploymentId, FileStateStore, StateStore};

fn test_config() -> DeployConfig {
    DeployConfig {
        handler_timeout_ms: 1_000,
        backoff_base_ms: 1,
        ..DeployConfig::default()
    }
}

/// Everything a CLI invocation would build, sharing the backend and the
/// state directory with earlier invocations.
async fn deployment(
    store: Arc<FileStateStore>,
    backend: Arc<SimulatedBackend>,
    overrides: &[(&str, &str)],
) -> (Deployment, DeployPlan, GrantRegistry) {
    let config = test_config();
    let id = DeploymentId::new("dashboards");
    let ctx = DeploymentContext::load_or_init(store.as_ref(), id.clone(), &config)
        .await
        .expect("context");

    let mut grants = GrantRegistry::new();
    let composer = blueprint::dashboards(&ctx, &mut grants).expect("compose");
    let overrides: BTreeMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let plan = composer.plan(&overrides).expect("plan");

    let controller = Arc::new(LifecycleController::new(
        id.clone(),
        Arc::new(LocalHandler::new()),
        store.clone(),
        ControllerConfig::from(&config),
    ));
    let deployment = Deployment::new(
        id,
        backend,
        controller,
        store,
        Arc::new(MemoryDeployLedger::new()),
        ExecutorConfig::from(&config),
    );
    (deployment, plan, grants)
}

#[tokio::test]
async fn dashboards_deploy_publishes_link_and_runs_customizer() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(dir.path()).unwrap());
    let backend = Arc::new(SimulatedBackend::default());

    let (deployment, plan, grants) = deployment(store.clone(), backend.clone(), &[]).await;
    assert_eq!(grants.len(), 3);

    let report = deployment.deploy(&plan).await.expect("deploy");
    assert!(report.success(), "failures: {:?}", report.failed);
    assert!(report.skipped.is_empty());

    let link = report.output(SEARCH_GROUP, "DashboardsLink").unwrap();
    assert!(link.starts_with("https://search-"), "{link}");
    assert!(link.ends_with("/_dashboards"), "{link}");
    assert_eq!(
        link,
        format!(
            "https://{}/_dashboards",
            report.output(SEARCH_GROUP, "DomainEndpoint").unwrap()
        )
    );

    let address = format!("{APP_GROUP}/dashboardsCustomizer");
    assert_eq!(report.action_for(&address), Some(NodeAction::Created));
    let customizer = store
        .get_custom_resource(deployment.id(), &address)
        .await
        .unwrap()
        .expect("customizer recorded");
    assert_eq!(
        customizer.properties["Host"],
        serde_json::json!(report.output(SEARCH_GROUP, "DomainEndpoint").unwrap())
    );
    assert!(customizer.handler_ref.contains(":function:"));
    assert!(customizer.physical_id.starts_with("dashboardsCustomizer-"));
}

#[tokio::test]
async fn second_invocation_reuses_token_and_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(dir.path()).unwrap());
    let backend = Arc::new(SimulatedBackend::default());

    let (first, plan, _) = deployment(store.clone(), backend.clone(), &[]).await;
    first.deploy(&plan).await.unwrap();
    let calls = backend.calls().len();

    let (second, plan_again, _) = deployment(store.clone(), backend.clone(), &[]).await;
    assert_eq!(plan.order(), plan_again.order());
    let report = second.deploy(&plan_again).await.unwrap();
    assert!(report.success());
    assert!(report
        .settled
        .iter()
        .all(|(_, action)| *action == NodeAction::Unchanged));
    assert_eq!(backend.calls().len(), calls);
}

#[tokio::test]
async fn renaming_the_domain_updates_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(dir.path()).unwrap());
    let backend = Arc::new(SimulatedBackend::default());

    let (first, plan, _) = deployment(store.clone(), backend.clone(), &[]).await;
    first.deploy(&plan).await.unwrap();

    let (second, plan, _) = deployment(
        store.clone(),
        backend.clone(),
        &[("openSearchDomainName", "waf-renamed")],
    )
    .await;
    let report = second.deploy(&plan).await.unwrap();
    assert!(report.success(), "failures: {:?}", report.failed);
    assert_eq!(report.action_for("search/domain"), Some(NodeAction::Updated));
    assert_eq!(
        report.output(SEARCH_GROUP, "DashboardsLink"),
        Some("https://search-waf-renamed.us-east-1.es.localhost/_dashboards")
    );

    let address = format!("{APP_GROUP}/dashboardsCustomizer");
    assert_eq!(report.action_for(&address), Some(NodeAction::Updated));
    let customizer = store
        .get_custom_resource(second.id(), &address)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customizer.data["RequestType"], "UPDATE");
}

#[tokio::test]
async fn destroy_retains_the_delivery_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(dir.path()).unwrap());
    let backend = Arc::new(SimulatedBackend::default());

    let (deployment, plan, _) = deployment(store.clone(), backend.clone(), &[]).await;
    deployment.deploy(&plan).await.unwrap();

    let report = deployment.destroy().await.unwrap();
    assert!(report.success(), "failures: {:?}", report.failed);
    assert_eq!(
        report.action_for("ingestion/deliveryBucket"),
        Some(NodeAction::Retained)
    );
    assert_eq!(backend.live_ids().len(), 1);

    let state = store.load(deployment.id()).await.unwrap();
    assert!(state.is_empty());
    assert!(state.uniqueness_token.is_some());
}
