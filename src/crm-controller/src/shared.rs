//! State shared between the `ResourceManager` state machine and the
//! `BrokerSet`: the registered-resource map, the pool, the store, and the
//! operator. Kept in one place so a broker's own spare resources are
//! created/destroyed with exactly the same primitives a regular launch
//! uses, without the two subsystems holding `Arc`s back to each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crm_operator::Operator;
use crm_stash::{ResourceRow, ResourceStore};

use crate::error::CrmError;
use crate::pool::NodeInfoPool;

pub struct Shared {
    pub cluster_id: String,
    pub pool: NodeInfoPool,
    pub store: Arc<dyn ResourceStore>,
    pub operator: Arc<dyn Operator>,
    pub locks: crate::lock::LockTable,
    /// The in-memory registered-resource map: every non-released resource
    /// the manager currently knows about.
    pub registered: DashMap<String, ResourceRow>,
    pub running: AtomicBool,
    /// The supervisor's current leadership scope. Replaced on every
    /// promotion; background tasks spawned for that scope (tracers
    /// included) are handed a clone and exit on its cancellation.
    scope: StdRwLock<CancellationToken>,
}

impl Shared {
    pub fn new(cluster_id: String, store: Arc<dyn ResourceStore>, operator: Arc<dyn Operator>) -> Self {
        Shared {
            cluster_id,
            pool: NodeInfoPool::new(),
            store,
            operator,
            locks: crate::lock::LockTable::new(),
            registered: DashMap::new(),
            running: AtomicBool::new(false),
            scope: StdRwLock::new(CancellationToken::new()),
        }
    }

    pub fn require_master(&self) -> Result<(), CrmError> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CrmError::ManagerNotRunning)
        }
    }

    pub fn current_scope(&self) -> CancellationToken {
        self.scope.read().unwrap().clone()
    }

    /// Opens a fresh leadership scope, cancelling whatever scope preceded it
    /// Demotion cancels all background loops for the old scope.
    pub fn open_new_scope(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut scope = self.scope.write().unwrap();
        scope.cancel();
        *scope = token.clone();
        token
    }

    pub fn close_scope(&self) {
        self.scope.read().unwrap().cancel();
    }

    /// Spawns the compensating release an operator or persistence failure
    /// after a pool reservation must trigger, giving the reservation back
    /// once gated on the next snapshot.
    pub fn spawn_compensating_release(self: &Arc<Self>, block_key: String, amount: u32) {
        if amount == 0 {
            return;
        }
        let shared = self.clone();
        let reserved_at = Utc::now();
        crm_ore::task::spawn(
            || format!("release-no-ready-{block_key}"),
            async move {
                shared
                    .pool
                    .release_no_ready_instance(&block_key, amount, reserved_at)
                    .await;
            },
        );
    }
}
