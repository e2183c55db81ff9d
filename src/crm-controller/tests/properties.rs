//! Property tests for pool conservation, monotone `no_ready_instance`
//! during a deploy, and resource-id normalisation, plus deterministic
//! checks for persistence/recovery invariants where a generator would add
//! little over a direct assertion.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use proptest::prelude::*;

use crm_controller::handler::normalise_resource_id;
use crm_controller::{BrokerSet, Condition, CrmError, ResourceManager, Shared};
use crm_operator::{MockOperator, ServerState, ServerStatus};
use crm_stash::{InMemoryResourceStore, ResourceParam, ResourceStatus};

fn param() -> ResourceParam {
    ResourceParam {
        city: "sh".into(),
        platform: "linux".into(),
        image: "img:v1".into(),
        ..ResourceParam::default()
    }
}

async fn no_ready_is_monotone_body(request: u32, readings: Vec<u32>) -> Result<(), TestCaseError> {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new(
        "cluster".into(),
        Arc::new(InMemoryResourceStore::new()),
        operator.clone(),
    ));
    shared.running.store(true, Ordering::SeqCst);
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    shared.pool.update_resources([(Condition::new("sh", "linux"), 20)]);
    manager.init_for_user("job", "u", param()).await.unwrap();
    manager.launch("job", None, |available| Ok(available.min(request)), false).await.unwrap();

    let mut last_no_ready = shared.registered.get("job").unwrap().no_ready_instance;
    for reading in readings {
        operator.set_status(
            "crm",
            "job",
            ServerStatus { status: ServerState::Staging, current_instances: reading.min(request) },
        );
        let _ = manager.get_service_info("job").await;
        let Some(row) = shared.registered.get("job") else { break };
        if row.status != ResourceStatus::Deploying {
            break;
        }
        prop_assert!(row.no_ready_instance <= last_no_ready);
        last_no_ready = row.no_ready_instance;
    }
    Ok(())
}

proptest! {
    /// For any user and caller-supplied id, the normalised id is lowercase
    /// with every `_` replaced by `-`, and re-normalising it changes
    /// nothing but the re-added user prefix.
    #[test]
    fn normalisation_is_lowercase_hyphenated(
        user in "[A-Za-z0-9_]{1,12}",
        id in "[A-Za-z0-9_]{1,12}",
    ) {
        let normalised = normalise_resource_id(&user, &id);
        prop_assert_eq!(&normalised, &normalised.to_lowercase());
        prop_assert!(!normalised.contains('_'));

        let twice = normalise_resource_id(&user, &normalised);
        prop_assert_eq!(twice, format!("{}-{normalised}", user.to_lowercase().replace('_', "-")));
    }

    /// Across any sequence of `get_service_info` calls with the same
    /// `request_instance`, `no_ready_instance` never increases until it
    /// hits zero.
    #[test]
    fn no_ready_is_monotone_non_increasing(
        request in 1u32..8,
        readings in prop::collection::vec(0u32..8, 1..6),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(no_ready_is_monotone_body(request, readings))?;
    }
}

/// After a sequence of reserve/refund operations settles, `free + no_ready
/// == total` for the touched block (no running/deploying resources
/// outstanding in this scenario, so their share is zero).
#[tokio::test]
async fn conservation_holds_after_reserve_and_refund() {
    let pool = crm_controller::NodeInfoPool::new();
    let condition = Condition::new("sh", "linux");
    pool.update_resources([(condition.clone(), 10)]);

    let (granted, key) = pool.get_free_instances(&condition, |available| Ok(available.min(4))).unwrap();
    assert_eq!(granted, 4);
    let detail = pool.get_detail();
    let block = detail.iter().find(|b| b.key == key).unwrap();
    assert_eq!(block.free + block.no_ready, 10);

    let reserved_at = pool.get_last_update_time();
    pool.release_no_ready_instance(&key, granted, reserved_at).await;
    pool.update_resources([(condition.clone(), 10)]);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let detail = pool.get_detail();
    let block = detail.iter().find(|b| b.key == key).unwrap();
    assert_eq!(block.free + block.no_ready, 10);
    assert_eq!(block.free, 10);
}

/// After `init`/`launch` return successfully, `store.get` reconstructs a
/// row identical to the in-memory one.
#[tokio::test]
async fn persistence_matches_memory_after_launch() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let store = Arc::new(InMemoryResourceStore::new());
    let shared = Arc::new(Shared::new("cluster".into(), store.clone(), operator));
    shared.running.store(true, Ordering::SeqCst);
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    shared.pool.update_resources([(Condition::new("sh", "linux"), 10)]);
    manager.init_for_user("job", "u", param()).await.unwrap();
    manager.launch("job", None, |available| Ok(available.min(3)), false).await.unwrap();

    let in_memory = shared.registered.get("job").unwrap().clone();
    let persisted = store.get("job").await.unwrap().unwrap();
    assert_eq!(in_memory, persisted);
}

/// Every user operation invoked while not master fails fast without
/// reaching the operator.
#[tokio::test]
async fn leader_gating_rejects_without_touching_operator() {
    let operator = Arc::new(MockOperator::new(vec![]));
    let shared = Arc::new(Shared::new("cluster".into(), Arc::new(InMemoryResourceStore::new()), operator.clone()));
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers);

    let err = manager.init_for_user("job", "u", param()).await.unwrap_err();
    assert!(matches!(err, CrmError::ManagerNotRunning));
    let err = manager.launch("job", None, |_| Ok(1), false).await.unwrap_err();
    assert!(matches!(err, CrmError::ManagerNotRunning));
    let err = manager.release("job").await.unwrap_err();
    assert!(matches!(err, CrmError::ManagerNotRunning));

    assert!(operator.get_resource("cluster").await.unwrap().is_empty());
    assert!(shared.registered.is_empty());
}
