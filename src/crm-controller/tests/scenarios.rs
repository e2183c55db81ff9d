//! End-to-end flows against `MockOperator` + `InMemoryResourceStore`,
//! covering deploy completion, scale-up, operator failure, broker-backed
//! release, and a leader flap followed by recovery.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crm_controller::{BrokerSet, ConstStrategy, CrmError, ResourceManager, Shared};
use crm_controller::broker::Broker;
use crm_operator::{MockOperator, ServerState, ServerStatus};
use crm_stash::{InMemoryResourceStore, ResourceParam};

fn param() -> ResourceParam {
    ResourceParam {
        city: "sh".into(),
        platform: "linux".into(),
        image: "img:v1".into(),
        ..ResourceParam::default()
    }
}

#[tokio::test]
async fn fresh_deploying_status_drives_terminal_transition() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new(
        "test-cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 10)]);
    manager.init_for_user("job1", "alice", param()).await.unwrap();
    manager.launch("job1", None, |available| Ok(available.min(3)), false).await.unwrap();
    assert_eq!(shared.pool.get_detail()[0].free, 7);

    operator.set_status("crm", "job1", ServerStatus { status: ServerState::Running, current_instances: 3 });
    let done = manager.get_service_info("job1").await.unwrap();
    assert!(done);
    let row = shared.registered.get("job1").unwrap().clone();
    assert_eq!(row.status, crm_stash::ResourceStatus::Running);
    assert_eq!(row.no_ready_instance, 0);

    // The Pool reservation isn't released until the *next* snapshot lands.
    assert_eq!(shared.pool.get_detail()[0].free, 7);
    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 10)]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(shared.pool.get_detail()[0].free, 10);
}

#[tokio::test]
async fn scale_up_grows_request_and_reserves_delta() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new(
        "test-cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 10)]);
    manager.init_for_user("job1", "alice", param()).await.unwrap();
    manager.launch("job1", None, |available| Ok(available.min(3)), false).await.unwrap();
    operator.set_status("crm", "job1", ServerStatus { status: ServerState::Running, current_instances: 3 });
    manager.get_service_info("job1").await.unwrap();
    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 10)]);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(shared.pool.get_detail()[0].free, 10);

    manager.scale("job1", |_available| Ok(2)).await.unwrap();
    let row = shared.registered.get("job1").unwrap().clone();
    assert_eq!(row.request_instance, 5);
    assert_eq!(row.no_ready_instance, 2);
    assert_eq!(row.status, crm_stash::ResourceStatus::Deploying);
    assert_eq!(shared.pool.get_detail()[0].free, 8);
    assert_eq!(shared.pool.get_detail()[0].no_ready, 2);
}

#[tokio::test]
async fn operator_failure_leaves_row_at_init_and_refunds_pool() {
    let operator = Arc::new(MockOperator::new(vec![]));
    operator.fail_next_launch();
    let shared = Arc::new(Shared::new(
        "test-cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 5)]);
    manager.init_for_user("job1", "alice", param()).await.unwrap();
    let err = manager.launch("job1", None, |available| Ok(available.min(5)), false).await.unwrap_err();
    assert!(matches!(err, CrmError::Operator(_)));

    let row = shared.registered.get("job1").unwrap().clone();
    assert_eq!(row.status, crm_stash::ResourceStatus::Init);
    // Pool shows 0 free immediately (reservation happened before the
    // operator call); it never gets stuck there.
    assert_eq!(shared.pool.get_detail()[0].free, 0);
    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 5)]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(shared.pool.get_detail()[0].free, 5);
}

#[tokio::test]
async fn release_of_broker_backed_skips_second_teardown() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new(
        "test-cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let mut broker_set = BrokerSet::new(shared.clone());
    broker_set.register(Broker::new("pool-a", "broker-user", param(), Box::new(ConstStrategy { target: 1 })));
    let brokers = Arc::new(broker_set);
    let manager = ResourceManager::new(shared.clone(), brokers.clone());

    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 5)]);
    let broker = brokers.get("pool-a").unwrap();
    broker.launch(&shared).await.unwrap();
    let spare_id = shared
        .registered
        .iter()
        .find(|e| !e.value().broker_name.is_empty())
        .map(|e| e.key().clone())
        .unwrap();
    operator.set_status("crm", &spare_id, ServerStatus { status: ServerState::Running, current_instances: 1 });
    shared.registered.alter(&spare_id, |_, mut row| {
        row.status = crm_stash::ResourceStatus::Running;
        row.no_ready_instance = 0;
        row
    });

    manager.init_for_user("job1", "alice", param()).await.unwrap();
    manager.launch("job1", None, |_| Ok(1), true).await.unwrap();
    let row = shared.registered.get("job1").unwrap().clone();
    assert_eq!(row.broker_resource_id, spare_id);
    assert_eq!(row.status, crm_stash::ResourceStatus::Running);

    manager.release("job1").await.unwrap();
    assert!(shared.registered.get("job1").is_none());
    assert!(shared.registered.get(&spare_id).is_none());
    // The broker must forget the spare once it's torn down, or it will
    // never see it as missing and launch a replacement.
    assert_eq!(broker.owned_count(), 0);
}

#[tokio::test]
async fn launch_falls_back_to_pool_when_broker_has_no_spare_yet() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new(
        "test-cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let mut broker_set = BrokerSet::new(shared.clone());
    broker_set.register(Broker::new("pool-a", "broker-user", param(), Box::new(ConstStrategy { target: 1 })));
    let brokers = Arc::new(broker_set);
    let manager = ResourceManager::new(shared.clone(), brokers);

    // The broker is registered but hasn't launched any spare yet (the
    // strategy loop's grace period), so it has nothing to hand over.
    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 5)]);
    manager.init_for_user("job1", "alice", param()).await.unwrap();
    manager.launch("job1", None, |available| Ok(available.min(2)), true).await.unwrap();

    let row = shared.registered.get("job1").unwrap().clone();
    assert!(row.broker_resource_id.is_empty());
    assert_eq!(row.status, crm_stash::ResourceStatus::Deploying);
    assert_eq!(row.request_instance, 2);
    assert_eq!(shared.pool.get_detail()[0].free, 3);
}

#[tokio::test]
async fn leader_flap_then_recover_respawns_tracer() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new(
        "test-cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    shared.pool.update_resources([(crm_controller::Condition::new("sh", "linux"), 10)]);
    manager.init_for_user("job1", "alice", param()).await.unwrap();
    manager.launch("job1", None, |available| Ok(available.min(3)), false).await.unwrap();

    // Leader flap: demote.
    shared.running.store(false, Ordering::SeqCst);
    shared.close_scope();
    let err = manager.scale("job1", |_| Ok(1)).await.unwrap_err();
    assert!(matches!(err, CrmError::ManagerNotRunning));

    // Promote again: recover() re-reads the deploying row.
    shared.running.store(false, Ordering::SeqCst);
    let deploying = manager.recover().await.unwrap();
    shared.running.store(true, Ordering::SeqCst);
    assert_eq!(deploying, vec!["job1".to_string()]);
    let row = shared.registered.get("job1").unwrap().clone();
    assert_eq!(row.no_ready_instance, 3);
    // Pool free must reflect the re-established reservation, not double
    // count it once the next snapshot lands.
    let detail = shared.pool.get_detail();
    let block = detail.iter().find(|b| b.key == "sh/linux").unwrap();
    assert_eq!(block.no_ready, 3);
}
