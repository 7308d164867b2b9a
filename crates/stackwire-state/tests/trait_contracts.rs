//! Trait contract tests for StateStore and DeployLedger.
//!
//! Every StateStore contract is run against both the in-memory fake and the
//! file-backed store. Any conforming implementation must pass these.

use std::collections::BTreeMap;

use chrono::Utc;
use stackwire_state::fakes::{MemoryDeployLedger, MemoryStateStore};
use stackwire_state::storage_traits::*;
use stackwire_state::{FileStateStore, StorageError};

fn resource(address: &str) -> ResourceRecord {
    ResourceRecord {
        address: address.to_string(),
        group: address.split('/').next().unwrap().to_string(),
        kind: "search.domain".to_string(),
        backend_id: format!("id-{address}"),
        attributes: BTreeMap::from([("DomainEndpoint".to_string(), "d1.local".to_string())]),
        properties_digest: ContentDigest::from_bytes(address.as_bytes()),
        depends_on: Vec::new(),
        removal_policy: RemovalPolicy::Destroy,
        pending_deletes: Vec::new(),
        updated_at: Utc::now(),
    }
}

fn custom(address: &str, physical_id: &str) -> CustomResourceRecord {
    CustomResourceRecord {
        address: address.to_string(),
        group: "app".to_string(),
        handler_ref: "arn:aws:lambda:us-east-1:123456789012:function:customizer".to_string(),
        physical_id: physical_id.to_string(),
        properties: BTreeMap::from([("Host".to_string(), serde_json::json!("d1.local"))]),
        data: BTreeMap::new(),
        removal_policy: RemovalPolicy::Destroy,
        depends_on: vec!["app/customizerFn".to_string()],
        pending_deletes: Vec::new(),
        updated_at: Utc::now(),
    }
}

// ===========================================================================
// StateStore contract
// ===========================================================================

async fn contract_resource_round_trip(store: &dyn StateStore) {
    let id = DeploymentId::new("dash");
    let record = resource("search/domain");
    store.put_resource(&id, record.clone()).await.unwrap();

    let state = store.load(&id).await.unwrap();
    assert_eq!(state.resources.get("search/domain"), Some(&record));

    store.remove_resource(&id, "search/domain").await.unwrap();
    let state = store.load(&id).await.unwrap();
    assert!(state.resources.is_empty());

    // Removing again is a no-op.
    store.remove_resource(&id, "search/domain").await.unwrap();
}

async fn contract_token_first_write_wins(store: &dyn StateStore) {
    let id = DeploymentId::new("tokens");
    let first = store.init_token(&id, "aaaaaaaaaa").await.unwrap();
    let second = store.init_token(&id, "bbbbbbbbbb").await.unwrap();
    assert_eq!(first, "aaaaaaaaaa");
    assert_eq!(second, "aaaaaaaaaa");
}

async fn contract_custom_resource_lookup(store: &dyn StateStore) {
    let id = DeploymentId::new("dash");
    assert!(store
        .get_custom_resource(&id, "app/customizer")
        .await
        .unwrap()
        .is_none());

    store
        .put_custom_resource(&id, custom("app/customizer", "phys-1"))
        .await
        .unwrap();
    let found = store
        .get_custom_resource(&id, "app/customizer")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.physical_id, "phys-1");

    store
        .remove_custom_resource(&id, "app/customizer")
        .await
        .unwrap();
    assert!(store
        .get_custom_resource(&id, "app/customizer")
        .await
        .unwrap()
        .is_none());
}

async fn contract_outputs_are_replaced_per_group(store: &dyn StateStore) {
    let id = DeploymentId::new("dash");
    store
        .publish_outputs(
            &id,
            "search",
            BTreeMap::from([("DomainEndpoint".to_string(), "old".to_string())]),
        )
        .await
        .unwrap();
    store
        .publish_outputs(
            &id,
            "search",
            BTreeMap::from([("DomainEndpoint".to_string(), "new".to_string())]),
        )
        .await
        .unwrap();

    let state = store.load(&id).await.unwrap();
    assert_eq!(state.outputs["search"]["DomainEndpoint"], "new");

    store.retract_outputs(&id, "search").await.unwrap();
    assert!(store.load(&id).await.unwrap().outputs.is_empty());
}

async fn contract_lists_deployments(store: &dyn StateStore) {
    store
        .init_token(&DeploymentId::new("b-dep"), "t")
        .await
        .unwrap();
    store
        .init_token(&DeploymentId::new("a-dep"), "t")
        .await
        .unwrap();
    let ids = store.list_deployments().await.unwrap();
    let a = ids.iter().position(|d| d.as_str() == "a-dep").unwrap();
    let b = ids.iter().position(|d| d.as_str() == "b-dep").unwrap();
    assert!(a < b);
}

async fn run_state_contracts(store: &dyn StateStore) {
    contract_resource_round_trip(store).await;
    contract_token_first_write_wins(store).await;
    contract_custom_resource_lookup(store).await;
    contract_outputs_are_replaced_per_group(store).await;
    contract_lists_deployments(store).await;
}

#[tokio::test]
async fn memory_store_satisfies_contract() {
    let store = MemoryStateStore::new();
    run_state_contracts(&store).await;
}

#[tokio::test]
async fn file_store_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::new(dir.path()).unwrap();
    run_state_contracts(&store).await;
}

// ===========================================================================
// DeployLedger contract
// ===========================================================================

fn metadata() -> RunMetadata {
    RunMetadata {
        action: "deploy".to_string(),
        operator: "ci".to_string(),
        tags: serde_json::json!({}),
    }
}

fn event(seq: u64) -> RunEvent {
    RunEvent {
        seq,
        kind: "resource_settled".to_string(),
        payload: serde_json::json!({ "address": "search/domain" }),
        timestamp: Utc::now(),
    }
}

fn summary(success: bool) -> RunSummary {
    RunSummary {
        total_events: 2,
        settled: 1,
        failed: u64::from(!success),
        duration_ms: 5,
        success,
    }
}

#[tokio::test]
async fn ledger_records_events_in_order() {
    let ledger = MemoryDeployLedger::new();
    let dep = DeploymentId::new("dash");
    let run = ledger.create_run(&dep, metadata()).await.unwrap();
    ledger.append_event(&run, event(1)).await.unwrap();
    ledger.append_event(&run, event(2)).await.unwrap();

    let events = ledger.get_events(&run).await.unwrap();
    assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn ledger_rejects_out_of_order_seq() {
    let ledger = MemoryDeployLedger::new();
    let run = ledger
        .create_run(&DeploymentId::new("dash"), metadata())
        .await
        .unwrap();
    ledger.append_event(&run, event(2)).await.unwrap();
    let err = ledger.append_event(&run, event(2)).await.unwrap_err();
    assert!(matches!(err, StorageError::OutOfOrderEvent { .. }));
}

#[tokio::test]
async fn ledger_terminal_runs_are_immutable() {
    let ledger = MemoryDeployLedger::new();
    let run = ledger
        .create_run(&DeploymentId::new("dash"), metadata())
        .await
        .unwrap();
    ledger.complete_run(&run, summary(true)).await.unwrap();

    let err = ledger.append_event(&run, event(1)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
    let err = ledger.fail_run(&run, summary(false)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let record = ledger.get_run(&run).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn ledger_lists_runs_by_deployment() {
    let ledger = MemoryDeployLedger::new();
    let a = DeploymentId::new("a");
    let b = DeploymentId::new("b");
    ledger.create_run(&a, metadata()).await.unwrap();
    ledger.create_run(&a, metadata()).await.unwrap();
    ledger.create_run(&b, metadata()).await.unwrap();

    assert_eq!(ledger.list_runs(Some(&a)).await.unwrap().len(), 2);
    assert_eq!(ledger.list_runs(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn ledger_unknown_run_is_not_found() {
    let ledger = MemoryDeployLedger::new();
    let err = ledger.get_run(&RunId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}
