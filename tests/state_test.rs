use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use keel::config::types::Resource;
use keel::error::EngineError;
use keel::state::backend::StateBackend;
use keel::state::models::{OutputValue, RecordStatus, StateRecord};
use keel::state::sqlite::SqliteBackend;
use keel::state::store::StateStore;

async fn create_test_store(dir: &TempDir, stack: &str) -> StateStore {
    let backend = SqliteBackend::open(&dir.path().join("state.db")).unwrap();
    backend.initialize().await.unwrap();
    StateStore::new(Arc::new(backend), stack)
}

fn applied_record(id: &str, resource_type: &str) -> StateRecord {
    let resource = Resource::new(id, resource_type).with_property("name", id);
    let mut record = StateRecord::new(id, resource_type);
    record.provider_id = Some(format!("{}-0001", resource_type));
    record.properties = resource.properties.clone();
    record.resolved.insert("name".into(), json!(id));
    record.attributes.insert("arn".into(), json!(format!("arn:{}", id)));
    record.status = RecordStatus::Applied;
    record.refresh_fingerprint();
    record
}

fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|e| e.downcast_ref::<EngineError>())
}

#[tokio::test]
async fn test_initialize_is_repeatable() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::open(&dir.path().join("state.db")).unwrap();
    backend.initialize().await.unwrap();
    // Should not error on second init
    backend.initialize().await.unwrap();
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = create_test_store(&dir, "prod").await;
        let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();
        let mut vm = applied_record("vm", "compute-instance");
        vm.dependencies.insert("net".into());
        lease.save_record(&applied_record("net", "network")).await.unwrap();
        lease.save_record(&vm).await.unwrap();
        lease.release().await.unwrap();
    }

    let store = create_test_store(&dir, "prod").await;
    let records = store.load().await.unwrap();
    assert_eq!(records.keys().collect::<Vec<_>>(), vec!["net", "vm"]);
    let vm = &records["vm"];
    assert_eq!(vm.status, RecordStatus::Applied);
    assert_eq!(vm.provider_id.as_deref(), Some("compute-instance-0001"));
    assert!(vm.dependencies.contains("net"));
    assert_eq!(vm.attributes["arn"], json!("arn:vm"));
    assert_eq!(vm, &store.get("vm").await.unwrap().unwrap());
}

#[tokio::test]
async fn test_stacks_are_isolated() {
    let dir = TempDir::new().unwrap();
    let prod = create_test_store(&dir, "prod").await;
    let staging = create_test_store(&dir, "staging").await;

    let lease = prod.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();
    lease.save_record(&applied_record("net", "network")).await.unwrap();

    // A lease on one stack does not block another
    let other = staging.lock("bob", "apply", Duration::from_secs(60)).await.unwrap();
    other.release().await.unwrap();
    lease.release().await.unwrap();

    assert_eq!(prod.load().await.unwrap().len(), 1);
    assert!(staging.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_and_replace_all() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();

    lease.save_record(&applied_record("net", "network")).await.unwrap();
    assert!(lease.remove_record("net").await.unwrap());
    assert!(!lease.remove_record("net").await.unwrap());

    lease
        .save(&[applied_record("a", "bucket"), applied_record("b", "bucket")])
        .await
        .unwrap();
    lease.save(&[applied_record("c", "bucket")]).await.unwrap();
    lease.release().await.unwrap();

    let records = store.load().await.unwrap();
    assert_eq!(records.keys().collect::<Vec<_>>(), vec!["c"]);
}

#[tokio::test]
async fn test_second_writer_is_refused() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();

    let err = store
        .lock("bob", "apply", Duration::from_secs(60))
        .await
        .err()
        .unwrap();
    match engine_error(&err) {
        Some(EngineError::LockContention { holder, lease_id, .. }) => {
            assert_eq!(holder, "alice");
            assert_eq!(lease_id, &lease.lease().lease_id);
        }
        other => panic!("expected lock contention, got {:?}", other),
    }
    assert_eq!(engine_error(&err).map(EngineError::exit_code), Some(3));

    lease.release().await.unwrap();
    let again = store.lock("bob", "apply", Duration::from_secs(60)).await.unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let stale = store.lock("crashed", "apply", Duration::ZERO).await.unwrap();

    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();
    assert_eq!(store.current_lease().await.unwrap().unwrap().holder, "alice");

    // The old holder can no longer write
    let err = stale
        .save_record(&applied_record("net", "network"))
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::LeaseLost { .. })));
    lease.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_rechecks_lease_after_waiting_for_other_writer() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();

    // Another process holds the write lock while it takes the lease away
    let mut other = rusqlite::Connection::open(dir.path().join("state.db")).unwrap();
    let tx = other
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
        .unwrap();

    let writer = {
        let lease = lease.clone();
        tokio::spawn(async move { lease.save_record(&applied_record("net", "network")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());

    tx.execute("DELETE FROM leases WHERE stack = 'prod'", []).unwrap();
    tx.commit().unwrap();

    let err = writer.await.unwrap().unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::LeaseLost { .. })));
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_force_unlock_invalidates_holder() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();

    let dropped = store.force_unlock().await.unwrap().unwrap();
    assert_eq!(dropped.lease_id, lease.lease().lease_id);
    assert!(store.current_lease().await.unwrap().is_none());
    assert!(store.force_unlock().await.unwrap().is_none());

    let err = lease
        .save_record(&applied_record("net", "network"))
        .await
        .unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::LeaseLost { .. })));
    assert!(lease.renew(Duration::from_secs(60)).await.is_err());
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_renew_extends_expiry() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(1)).await.unwrap();
    let before = lease.lease().expires_at;

    let after = lease.renew(Duration::from_secs(600)).await.unwrap();
    assert!(after > before);
    let stored = store.current_lease().await.unwrap().unwrap();
    assert!(stored.expires_at > before);
    assert!((after - stored.expires_at).num_milliseconds().abs() < 1);
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_outputs_replace_previous_set() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();

    lease
        .set_outputs(&[
            OutputValue {
                name: "vpc_id".into(),
                value: Some(json!("network-0001")),
                description: Some("The VPC".into()),
            },
            OutputValue {
                name: "endpoint".into(),
                value: None,
                description: None,
            },
        ])
        .await
        .unwrap();
    let outputs = store.outputs().await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].name, "endpoint");
    assert_eq!(outputs[0].value, None);
    assert_eq!(outputs[1].value, Some(json!("network-0001")));
    assert_eq!(outputs[1].description.as_deref(), Some("The VPC"));

    lease.set_outputs(&[]).await.unwrap();
    assert!(store.outputs().await.unwrap().is_empty());
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_run_history() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();
    let backend = lease.backend();

    let run_id = backend.start_run(lease.lease(), "apply", 2).await.unwrap();
    let running = store.runs(5).await.unwrap();
    assert_eq!(running[0].status, "running");
    assert!(running[0].completed_at.is_none());

    for (sequence, (id, outcome)) in [("net", "succeeded"), ("vm", "failed")].into_iter().enumerate() {
        backend
            .record_operation(
                &run_id,
                &keel::state::models::OperationRecord {
                    sequence: sequence as i64,
                    resource_id: id.into(),
                    operation: "create".into(),
                    outcome: outcome.into(),
                    message: (outcome == "failed").then(|| "quota exceeded".to_string()),
                },
            )
            .await
            .unwrap();
    }
    backend.complete_run(&run_id, "partial", 1, 1, 0).await.unwrap();
    lease.release().await.unwrap();

    let runs = store.runs(5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
    assert_eq!(runs[0].status, "partial");
    assert_eq!((runs[0].planned, runs[0].succeeded, runs[0].failed), (2, 1, 1));
    assert!(runs[0].completed_at.is_some());

    let dir_backend = SqliteBackend::open(&dir.path().join("state.db")).unwrap();
    let operations = dir_backend.list_run_operations(&run_id).await.unwrap();
    assert_eq!(operations.len(), 2);
    assert_eq!(operations[1].resource_id, "vm");
    assert_eq!(operations[1].message.as_deref(), Some("quota exceeded"));
}

#[tokio::test]
async fn test_pending_and_failed_records_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = create_test_store(&dir, "prod").await;
    let lease = store.lock("alice", "apply", Duration::from_secs(60)).await.unwrap();

    let mut failed = StateRecord::new("db", "managed-database");
    failed.status = RecordStatus::Failed;
    failed.error = Some("validation failed: engine".into());
    lease.save_record(&failed).await.unwrap();
    lease.release().await.unwrap();

    let db = store.get("db").await.unwrap().unwrap();
    assert_eq!(db.status, RecordStatus::Failed);
    assert_eq!(db.provider_id, None);
    assert_eq!(db.error.as_deref(), Some("validation failed: engine"));
    assert!(!db.is_live());
}
