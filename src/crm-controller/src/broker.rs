//! Pool of pre-warmed "hot-spare" resources.
//!
//! A broker's own spare resources are ordinary `ResourceRow`s — created and
//! torn down with exactly the same pool/operator/store primitives a plain
//! `Launch`/`Release` uses (via `Shared`) — distinguished only by having
//! `broker_name` set. `Apply` hands one such spare over to a fresh `Launch`
//! by marking it `broker_sold`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crm_operator::LaunchSpec;
use crm_stash::{ResourceParam, ResourceRow, ResourceStatus};

use crate::error::CrmError;
use crate::pool::Condition;
use crate::shared::Shared;

const BROKER_CHECKER_SLEEP_TIME: Duration = Duration::from_secs(10);
const BROKER_CHECKER_TIME_GAP: Duration = Duration::from_secs(1);
const BROKER_LAUNCH_COOLDOWN: Duration = Duration::from_secs(2);
const DEFAULT_NAMESPACE: &str = "crm";

/// A signed target for how many spares a broker should carry.
pub trait BrokerStrategy: Send + Sync {
    /// Returns `target - current_num`, positive meaning "launch more".
    fn delta(&self, current_num: u32) -> i64;
}

/// The only strategy this core implements; others stay reserved extension
/// slots.
pub struct ConstStrategy {
    pub target: u32,
}

impl BrokerStrategy for ConstStrategy {
    fn delta(&self, current_num: u32) -> i64 {
        i64::from(self.target) - i64::from(current_num)
    }
}

/// One named pool of pre-warmed spares.
pub struct Broker {
    pub name: String,
    user: String,
    param: ResourceParam,
    strategy: Box<dyn BrokerStrategy>,
    /// resourceIDs this broker owns (sold or not).
    owned: DashSet<String>,
    last_launch_attempt: StdMutex<Option<Instant>>,
}

impl Broker {
    pub fn new(name: impl Into<String>, user: impl Into<String>, param: ResourceParam, strategy: Box<dyn BrokerStrategy>) -> Self {
        Broker {
            name: name.into(),
            user: user.into(),
            param,
            strategy,
            owned: DashSet::new(),
            last_launch_attempt: StdMutex::new(None),
        }
    }

    fn real_name(&self, resource_id: &str) -> (String, String) {
        (DEFAULT_NAMESPACE.to_string(), resource_id.to_string())
    }

    /// Launches one more spare. Stops early with `BrokeringUnderCoolingTime`
    /// if called again before the cooldown elapses, or
    /// `BrokerNotEnoughResources` if the pool can't grant even one instance.
    pub async fn launch(&self, shared: &Arc<Shared>) -> Result<(), CrmError> {
        {
            let mut last = self.last_launch_attempt.lock().unwrap();
            if let Some(t) = *last {
                if t.elapsed() < BROKER_LAUNCH_COOLDOWN {
                    return Err(CrmError::BrokeringUnderCoolingTime);
                }
            }
            *last = Some(Instant::now());
        }

        let resource_id = format!("broker-{}-{}", self.name, Uuid::new_v4());
        let condition = Condition::new(&self.param.city, &self.param.platform);
        let (granted, block_key) = shared.pool.get_free_instances(&condition, |available| {
            if available == 0 {
                Err(CrmError::BrokerNotEnoughResources)
            } else {
                Ok(available.min(1))
            }
        })?;

        let (namespace, name) = self.real_name(&resource_id);
        let spec = LaunchSpec {
            name: name.clone(),
            namespace: namespace.clone(),
            city: self.param.city.clone(),
            platform: self.param.platform.clone(),
            env: self.param.env.clone().into_iter().collect(),
            ports: self.param.ports.clone().into_iter().collect(),
            volumes: self.param.volumes.clone().into_iter().collect(),
            image: self.param.image.clone(),
            instance: granted,
        };

        match shared.operator.launch_server(&shared.cluster_id, spec).await {
            Ok(()) => {
                let mut row = ResourceRow::new_init(resource_id.clone(), self.user.clone(), self.param.clone(), Utc::now());
                row.resource_block_key = block_key;
                row.request_instance = granted;
                row.no_ready_instance = granted;
                row.status = ResourceStatus::Deploying;
                row.broker_name = self.name.clone();
                shared.store.create(row.clone()).await?;
                shared.registered.insert(resource_id.clone(), row);
                self.owned.insert(resource_id);
                Ok(())
            }
            Err(e) => {
                shared.spawn_compensating_release(block_key, granted);
                Err(e.into())
            }
        }
    }

    /// Tears down one unsold spare (the strategy loop's negative-delta
    /// path). Picks an arbitrary unsold owned resource.
    pub async fn release(&self, shared: &Arc<Shared>) -> Result<(), CrmError> {
        let candidate = self.owned.iter().find_map(|id| {
            shared
                .registered
                .get(id.key())
                .filter(|row| !row.broker_sold && row.status != ResourceStatus::Released)
                .map(|_| id.key().clone())
        });
        let Some(resource_id) = candidate else {
            return Ok(());
        };
        self.release_owned(shared, &resource_id).await
    }

    async fn release_owned(&self, shared: &Arc<Shared>, resource_id: &str) -> Result<(), CrmError> {
        let Some(mut row) = shared.registered.get_mut(resource_id).map(|r| r.clone()) else {
            self.owned.remove(resource_id);
            return Ok(());
        };
        let (namespace, name) = self.real_name(resource_id);
        match shared.operator.release_server(&shared.cluster_id, &namespace, &name).await {
            Ok(()) | Err(crm_operator::OperatorError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        if row.no_ready_instance > 0 {
            shared.spawn_compensating_release(row.resource_block_key.clone(), row.no_ready_instance);
        }
        row.status = ResourceStatus::Released;
        row.no_ready_instance = 0;
        shared.store.put(row).await?;
        shared.registered.remove(resource_id);
        self.owned.remove(resource_id);
        Ok(())
    }

    /// Selects an unsold, compatible spare and marks it sold. `filter_fn`
    /// receives the count of compatible unsold spares and returns how many
    /// to take (only `>= 1` results in a takeover).
    pub async fn apply(
        &self,
        shared: &Arc<Shared>,
        wanted: &ResourceParam,
        filter_fn: &(dyn Fn(u32) -> Result<u32, CrmError> + Send + Sync),
    ) -> Result<Option<String>, CrmError> {
        let compatible: Vec<String> = self
            .owned
            .iter()
            .filter_map(|id| {
                shared.registered.get(id.key()).and_then(|row| {
                    let compatible = !row.broker_sold
                        && row.status == ResourceStatus::Running
                        && row.param.city == wanted.city
                        && row.param.platform == wanted.platform
                        && row.param.image == wanted.image;
                    compatible.then(|| id.key().clone())
                })
            })
            .collect();

        if compatible.is_empty() {
            return Ok(None);
        }
        let granted = filter_fn(compatible.len() as u32)?;
        if granted == 0 {
            return Ok(None);
        }
        let Some(chosen) = compatible.into_iter().next() else {
            return Ok(None);
        };
        if let Some(mut row) = shared.registered.get_mut(&chosen) {
            row.broker_sold = true;
            shared.store.put(row.clone()).await?;
        }
        Ok(Some(chosen))
    }

    /// Rebuilds `owned` from the store on role-promotion.
    pub fn recover_owned(&self, rows: &[ResourceRow]) {
        for row in rows {
            if row.broker_name == self.name {
                self.owned.insert(row.resource_id.clone());
            }
        }
    }

    /// Drops `resource_id` from `owned` without tearing anything down —
    /// for when the caller already released it through another path.
    pub fn forget(&self, resource_id: &str) {
        self.owned.remove(resource_id);
    }

    fn current_num(&self) -> u32 {
        self.owned.len() as u32
    }

    /// Count of resource ids this broker still believes it owns.
    pub fn owned_count(&self) -> u32 {
        self.current_num()
    }
}

/// The set of brokers known to the manager, plus the strategy loop that
/// keeps each one at its target spare count.
pub struct BrokerSet {
    brokers: BTreeMap<String, Arc<Broker>>,
    shared: Arc<Shared>,
}

impl BrokerSet {
    pub fn new(shared: Arc<Shared>) -> Self {
        BrokerSet {
            brokers: BTreeMap::new(),
            shared,
        }
    }

    pub fn register(&mut self, broker: Broker) {
        self.brokers.insert(broker.name.clone(), Arc::new(broker));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Broker>> {
        self.brokers.get(name).cloned()
    }

    /// Tells the broker named `owner` to drop `resource_id` from its owned
    /// set, if that broker is still registered.
    pub fn forget(&self, owner: &str, resource_id: &str) {
        if let Some(broker) = self.brokers.get(owner) {
            broker.forget(resource_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    /// Finds a broker eligible for `wanted`: the hinted name if given and
    /// known, otherwise any registered broker (first compatible match wins
    /// inside `Broker::apply`).
    pub fn candidates(&self, wanted: &ResourceParam) -> Vec<Arc<Broker>> {
        if let Some(hint) = &wanted.broker_name_hint {
            self.brokers.get(hint).cloned().into_iter().collect()
        } else {
            self.brokers.values().cloned().collect()
        }
    }

    /// Re-reads broker ownership from the store, invoked before any
    /// user-facing operation on role-promotion.
    pub async fn recover(&self) -> Result<(), CrmError> {
        let rows = self
            .shared
            .store
            .list(crm_stash::ResourceFilter::unbounded(vec![
                ResourceStatus::Init,
                ResourceStatus::Deploying,
                ResourceStatus::Running,
            ]))
            .await?;
        for broker in self.brokers.values() {
            broker.recover_owned(&rows);
        }
        Ok(())
    }

    /// Runs the strategy loop for every broker until `cancel` fires: an
    /// initial grace period, then every `brokerCheckerTimeGap` ask the
    /// strategy for a signed delta and launch/release spares to chase it.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(BROKER_CHECKER_SLEEP_TIME) => {}
        }
        let mut ticker = tokio::time::interval(BROKER_CHECKER_TIME_GAP);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for broker in self.brokers.values() {
                let delta = broker.strategy.delta(broker.current_num());
                if delta > 0 {
                    for _ in 0..delta {
                        match broker.launch(&self.shared).await {
                            Ok(()) => {}
                            Err(CrmError::BrokerNotEnoughResources) | Err(CrmError::BrokeringUnderCoolingTime) => break,
                            Err(e) => {
                                tracing::warn!(broker = %broker.name, error = %e, "broker launch failed");
                                break;
                            }
                        }
                    }
                } else if delta < 0 {
                    for _ in 0..(-delta) {
                        if let Err(e) = broker.release(&self.shared).await {
                            tracing::warn!(broker = %broker.name, error = %e, "broker release failed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
