//! The resource state machine: `init → deploying → running → released`,
//! with `scale` looping `running → deploying → running`. Every mutating
//! operation here holds the resource's lock table entry for its entire
//! duration and requires the manager to be in the master role.

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};

use crm_stash::{ResourceParam, ResourceRow, ResourceStatus};

use crate::broker::BrokerSet;
use crate::error::CrmError;
use crate::pool::Condition;
use crate::shared::Shared;
use crate::tracer;

const DEFAULT_NAMESPACE: &str = "crm";

/// Owns no state of its own beyond the shared primitives and the broker
/// set, both reached through `Arc` so tracers and broker background tasks
/// can hold their own handles without this type ever holding one back to
/// them.
pub struct ResourceManager {
    shared: Arc<Shared>,
    brokers: Arc<BrokerSet>,
}

fn real_name(resource_id: &str) -> (String, String) {
    (DEFAULT_NAMESPACE.to_string(), resource_id.to_string())
}

impl ResourceManager {
    pub fn new(shared: Arc<Shared>, brokers: Arc<BrokerSet>) -> Arc<Self> {
        Arc::new(ResourceManager { shared, brokers })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Creates a fresh row in the `init` state.
    pub async fn init(&self, resource_id: &str, param: ResourceParam) -> Result<(), CrmError> {
        self.shared.require_master()?;
        let _guard = self.shared.locks.acquire(resource_id).await;
        if self.shared.registered.contains_key(resource_id) {
            return Err(CrmError::ResourceAlreadyInit(resource_id.to_string()));
        }
        let row = ResourceRow::new_init(resource_id.to_string(), String::new(), param, Utc::now());
        self.shared.store.create(row.clone()).await?;
        self.shared.registered.insert(resource_id.to_string(), row);
        Ok(())
    }

    /// Same as `init`, but stamps `user` on the row (the manager is always
    /// reached through a `UserHandler`, never bare, so `user` is always
    /// known by the time a row is created).
    pub async fn init_for_user(&self, resource_id: &str, user: &str, param: ResourceParam) -> Result<(), CrmError> {
        self.shared.require_master()?;
        let _guard = self.shared.locks.acquire(resource_id).await;
        if self.shared.registered.contains_key(resource_id) {
            return Err(CrmError::ResourceAlreadyInit(resource_id.to_string()));
        }
        let row = ResourceRow::new_init(resource_id.to_string(), user.to_string(), param, Utc::now());
        self.shared.store.create(row.clone()).await?;
        self.shared.registered.insert(resource_id.to_string(), row);
        Ok(())
    }

    fn require_row(&self, resource_id: &str) -> Result<ResourceRow, CrmError> {
        self.shared
            .registered
            .get(resource_id)
            .map(|r| r.clone())
            .ok_or_else(|| CrmError::ResourceNoExist(resource_id.to_string()))
    }

    /// Moves a resource from `init` to `deploying`, taking over a
    /// pre-warmed broker spare if one is available and requested, else
    /// reserving Pool capacity and calling the operator directly.
    pub async fn launch(
        self: &Arc<Self>,
        resource_id: &str,
        city: Option<String>,
        filter_fn: impl Fn(u32) -> Result<u32, CrmError> + Send + Sync,
        use_broker: bool,
    ) -> Result<(), CrmError> {
        self.shared.require_master()?;
        let _guard = self.shared.locks.acquire(resource_id).await;
        let mut row = self.require_row(resource_id)?;
        if row.status != ResourceStatus::Init {
            return Err(CrmError::ApplicationAlreadyLaunched(resource_id.to_string()));
        }
        if let Some(city) = city {
            if !city.is_empty() {
                row.param.city = city;
            }
        }

        let must_broker = self.shared.operator.requires_broker();
        if must_broker || (use_broker && !self.brokers.is_empty()) {
            let candidates = self.brokers.candidates(&row.param);
            let mut taken = None;
            for broker in &candidates {
                let wanted = row.param.clone();
                match broker
                    .apply(&self.shared, &wanted, &|available| {
                        if available == 0 {
                            Err(CrmError::BrokerNotEnoughResources)
                        } else {
                            Ok(1)
                        }
                    })
                    .await
                {
                    Ok(Some(id)) => {
                        taken = Some(id);
                        break;
                    }
                    // No spare on this candidate; try the next one instead
                    // of aborting the whole launch.
                    Ok(None) | Err(CrmError::BrokerNotEnoughResources) => continue,
                    Err(e) => return Err(e),
                }
            }
            match taken {
                Some(broker_resource_id) => {
                    // The broker only hands over resources already `Running`
                    // (see `Broker::apply`), so the outer resource is
                    // immediately complete: no Pool reservation, no tracer.
                    row.broker_resource_id = broker_resource_id;
                    row.request_instance = 1;
                    row.no_ready_instance = 0;
                    row.status = ResourceStatus::Running;
                    self.shared.store.put(row.clone()).await?;
                    self.shared.registered.insert(resource_id.to_string(), row);
                    return Ok(());
                }
                None if must_broker => {
                    return Err(CrmError::BrokerNotEnoughResources);
                }
                None => {
                    // Fall through to a normal Pool-backed launch.
                }
            }
        }

        let condition = Condition::new(&row.param.city, &row.param.platform);
        let (granted, block_key) = self.shared.pool.get_free_instances(&condition, filter_fn)?;

        let spec = crm_operator::LaunchSpec {
            name: resource_id.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            city: row.param.city.clone(),
            platform: row.param.platform.clone(),
            env: row.param.env.clone(),
            ports: row.param.ports.clone(),
            volumes: row.param.volumes.clone(),
            image: row.param.image.clone(),
            instance: granted,
        };

        match self.shared.operator.launch_server(&self.shared.cluster_id, spec).await {
            Ok(()) => {
                row.resource_block_key = block_key.clone();
                row.request_instance = granted;
                row.no_ready_instance = granted;
                row.status = ResourceStatus::Deploying;
                if let Err(e) = self.shared.store.put(row.clone()).await {
                    self.shared.spawn_compensating_release(block_key, granted);
                    return Err(e.into());
                }
                self.shared.registered.insert(resource_id.to_string(), row);
                tracer::spawn_tracer(self.clone(), resource_id.to_string(), self.shared.current_scope());
                Ok(())
            }
            Err(e) => {
                self.shared.spawn_compensating_release(block_key, granted);
                Err(e.into())
            }
        }
    }

    /// Resizes a `running` resource, moving it back to `deploying`.
    pub fn scale<'a>(
        self: &'a Arc<Self>,
        resource_id: &'a str,
        filter_fn: impl Fn(u32) -> Result<i64, CrmError> + Send + Sync + 'a,
    ) -> BoxFuture<'a, Result<(), CrmError>> {
        async move {
            self.shared.require_master()?;
            let _guard = self.shared.locks.acquire(resource_id).await;
            let mut row = self.require_row(resource_id)?;
            if row.status != ResourceStatus::Running {
                return Err(CrmError::ResourceNotRunning(resource_id.to_string()));
            }

            if row.is_broker_backed() {
                let broker_id = row.broker_resource_id.clone();
                drop(_guard);
                return self.scale(&broker_id, filter_fn).await;
            }

            let condition = Condition::new(&row.param.city, &row.param.platform);
            let (delta, block_key) = self.shared.pool.get_scale_delta(&condition, filter_fn)?;
            let target = (row.request_instance as i64 + delta).max(0) as u32;

            if let Err(e) = self
                .shared
                .operator
                .scale_server(&self.shared.cluster_id, DEFAULT_NAMESPACE, resource_id, target)
                .await
            {
                if delta > 0 {
                    self.shared.spawn_compensating_release(block_key, delta as u32);
                }
                return Err(e.into());
            }

            row.request_instance = target;
            if delta > 0 {
                row.no_ready_instance = delta as u32;
                row.resource_block_key = block_key.clone();
            }
            row.status = ResourceStatus::Deploying;
            if let Err(e) = self.shared.store.put(row.clone()).await {
                if delta > 0 {
                    self.shared.spawn_compensating_release(block_key, delta as u32);
                }
                return Err(e.into());
            }
            self.shared.registered.insert(resource_id.to_string(), row);
            tracer::spawn_tracer(self.clone(), resource_id.to_string(), self.shared.current_scope());
            Ok(())
        }
        .boxed()
    }

    /// Tears a resource down and evicts it from the registered map.
    pub fn release<'a>(self: &'a Arc<Self>, resource_id: &'a str) -> BoxFuture<'a, Result<(), CrmError>> {
        async move {
            self.shared.require_master()?;
            let _guard = self.shared.locks.acquire(resource_id).await;

            let row = match self.shared.registered.get(resource_id).map(|r| r.clone()) {
                Some(row) => row,
                None => match self.shared.store.get(resource_id).await? {
                    Some(row) if row.status == ResourceStatus::Released => {
                        return Err(CrmError::ResourceAlreadyReleased(resource_id.to_string()));
                    }
                    Some(row) => row,
                    None => return Err(CrmError::ResourceNoExist(resource_id.to_string())),
                },
            };
            if row.status == ResourceStatus::Released {
                return Err(CrmError::ResourceAlreadyReleased(resource_id.to_string()));
            }

            if row.is_broker_backed() {
                let broker_id = row.broker_resource_id.clone();
                let broker_name = self
                    .shared
                    .registered
                    .get(&broker_id)
                    .map(|spare| spare.broker_name.clone());
                drop(_guard);
                self.release(&broker_id).await?;
                if let Some(broker_name) = broker_name {
                    self.brokers.forget(&broker_name, &broker_id);
                }
            } else {
                let (namespace, name) = real_name(resource_id);
                match self.shared.operator.release_server(&self.shared.cluster_id, &namespace, &name).await {
                    Ok(()) | Err(crm_operator::OperatorError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
                if row.no_ready_instance > 0 {
                    self.shared
                        .spawn_compensating_release(row.resource_block_key.clone(), row.no_ready_instance);
                }
            }

            let mut row = row;
            row.status = ResourceStatus::Released;
            row.no_ready_instance = 0;
            self.shared.store.put(row).await?;
            self.shared.registered.remove(resource_id);
            Ok(())
        }
        .boxed()
    }

    /// Returns whether the deploy has reached a terminal operator state —
    /// the signal the Tracer stops polling on.
    pub async fn get_service_info(&self, resource_id: &str) -> Result<bool, CrmError> {
        self.shared.require_master()?;
        let _guard = self.shared.locks.acquire(resource_id).await;
        let row = self.require_row(resource_id)?;

        let query_id = if row.is_broker_backed() {
            row.broker_resource_id.clone()
        } else {
            resource_id.to_string()
        };
        let (namespace, name) = real_name(&query_id);
        let status = self
            .shared
            .operator
            .get_server_status(&self.shared.cluster_id, &namespace, &name)
            .await?;
        let terminated = status.status.is_terminal();
        self.fresh_deploying_status(resource_id, row, status.current_instances, terminated)
            .await?;
        Ok(terminated)
    }

    /// The sole path by which observed ready counts mutate
    /// `no_ready_instance`.
    async fn fresh_deploying_status(
        &self,
        resource_id: &str,
        mut row: ResourceRow,
        current_instances: u32,
        terminated: bool,
    ) -> Result<(), CrmError> {
        if terminated {
            if row.no_ready_instance > 0 {
                self.shared
                    .spawn_compensating_release(row.resource_block_key.clone(), row.no_ready_instance);
            }
            row.no_ready_instance = 0;
            if row.status == ResourceStatus::Deploying {
                row.status = ResourceStatus::Running;
            }
            self.shared.store.put(row.clone()).await?;
            self.shared.registered.insert(resource_id.to_string(), row);
            return Ok(());
        }

        let current_no_ready = row.request_instance as i64 - current_instances as i64;
        if current_no_ready >= 0 && (row.no_ready_instance as i64) > current_no_ready {
            let diff = row.no_ready_instance as i64 - current_no_ready;
            self.shared
                .spawn_compensating_release(row.resource_block_key.clone(), diff as u32);
            row.no_ready_instance = current_no_ready as u32;
            self.shared.store.put(row.clone()).await?;
            self.shared.registered.insert(resource_id.to_string(), row);
        }
        Ok(())
    }

    /// True while a resource is still being brought up.
    pub async fn is_service_preparing(&self, resource_id: &str) -> Result<bool, CrmError> {
        self.shared.require_master()?;
        match self.shared.registered.get(resource_id) {
            Some(row) => Ok(matches!(row.status, ResourceStatus::Init | ResourceStatus::Deploying)),
            None => Ok(false),
        }
    }

    /// Resolves the broker's id if this resource was satisfied by a
    /// takeover, else its own id.
    pub async fn get_server_real_name(&self, resource_id: &str) -> Result<(String, String), CrmError> {
        let _guard = self.shared.locks.acquire(resource_id).await;
        let row = self.require_row(resource_id)?;
        let query_id = if row.is_broker_backed() { row.broker_resource_id } else { resource_id.to_string() };
        Ok(real_name(&query_id))
    }

    /// Loads every non-terminal row, rebuilds the registered map and the
    /// Pool's `noReady` accounting, and returns the ids still `deploying`
    /// so the supervisor can respawn their tracers.
    ///
    /// Runs on every promotion, including a same-process role flap where the
    /// registered map and Pool were never torn down in the first place — so
    /// a row already held in memory before this call must not have its
    /// reservation re-added to the Pool a second time.
    pub async fn recover(&self) -> Result<Vec<String>, CrmError> {
        let rows = self
            .shared
            .store
            .list(crm_stash::ResourceFilter::unbounded(vec![
                ResourceStatus::Init,
                ResourceStatus::Deploying,
                ResourceStatus::Running,
            ]))
            .await?;

        let already_known: std::collections::HashSet<String> =
            self.shared.registered.iter().map(|e| e.key().clone()).collect();

        let mut deploying = Vec::new();
        self.shared.registered.clear();
        for row in rows {
            if !already_known.contains(&row.resource_id)
                && row.status == ResourceStatus::Deploying
                && row.no_ready_instance > 0
                && !row.resource_block_key.is_empty()
            {
                self.shared.pool.recover_no_ready_block(&row.resource_block_key, row.no_ready_instance);
            }
            if row.status == ResourceStatus::Deploying {
                deploying.push(row.resource_id.clone());
            }
            self.shared.registered.insert(row.resource_id.clone(), row);
        }
        self.brokers.recover().await?;
        Ok(deploying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_operator::MockOperator;
    use crm_stash::InMemoryResourceStore;
    use std::sync::Arc;

    fn manager() -> Arc<ResourceManager> {
        let shared = Arc::new(Shared::new(
            "test-cluster".into(),
            Arc::new(InMemoryResourceStore::new()),
            Arc::new(MockOperator::new(vec![])),
        ));
        shared.running.store(true, std::sync::atomic::Ordering::SeqCst);
        let brokers = Arc::new(BrokerSet::new(shared.clone()));
        ResourceManager::new(shared, brokers)
    }

    fn param() -> ResourceParam {
        ResourceParam {
            city: "sh".into(),
            platform: "linux".into(),
            image: "img:v1".into(),
            ..ResourceParam::default()
        }
    }

    #[tokio::test]
    async fn happy_launch_reserves_and_deploys() {
        let manager = manager();
        manager.shared().pool.update_resources([(Condition::new("sh", "linux"), 10)]);
        manager.init_for_user("job1", "alice", param()).await.unwrap();
        manager
            .launch("job1", None, |available| Ok(available.min(3)), true)
            .await
            .unwrap();

        let row = manager.shared().registered.get("job1").unwrap().clone();
        assert_eq!(row.request_instance, 3);
        assert_eq!(row.no_ready_instance, 3);
        assert_eq!(row.status, ResourceStatus::Deploying);

        let detail = manager.shared().pool.get_detail();
        let block = detail.iter().find(|b| b.key == "sh/linux").unwrap();
        assert_eq!(block.free, 7);
        assert_eq!(block.no_ready, 3);
    }

    #[tokio::test]
    async fn launch_twice_fails_already_launched() {
        let manager = manager();
        manager.shared().pool.update_resources([(Condition::new("sh", "linux"), 10)]);
        manager.init_for_user("job1", "alice", param()).await.unwrap();
        manager.launch("job1", None, |available| Ok(available.min(3)), true).await.unwrap();
        let err = manager.launch("job1", None, |available| Ok(available.min(1)), true).await.unwrap_err();
        assert!(matches!(err, CrmError::ApplicationAlreadyLaunched(_)));
    }

    #[tokio::test]
    async fn release_unwinds_reservation_without_second_teardown() {
        let manager = manager();
        manager.shared().pool.update_resources([(Condition::new("sh", "linux"), 10)]);
        manager.init_for_user("job1", "alice", param()).await.unwrap();
        manager.launch("job1", None, |available| Ok(available.min(3)), true).await.unwrap();
        manager.release("job1").await.unwrap();
        assert!(manager.shared().registered.get("job1").is_none());

        let err = manager.release("job1").await.unwrap_err();
        assert!(matches!(err, CrmError::ResourceAlreadyReleased(_)));
    }

    #[tokio::test]
    async fn not_running_rejects_user_operations() {
        let manager = manager();
        manager.shared().running.store(false, std::sync::atomic::Ordering::SeqCst);
        let err = manager.init_for_user("job1", "alice", param()).await.unwrap_err();
        assert!(matches!(err, CrmError::ManagerNotRunning));
    }
}
