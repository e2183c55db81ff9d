//! The role listener and background-ticker owner. Drives Pool refresh,
//! lock-table reaping, broker reconciliation, and detail snapshots only
//! while this process holds the master role.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerSet;
use crate::details::{AppDetails, ResourceDetails};
use crate::pool::Condition;
use crate::shared::Shared;
use crate::state_machine::ResourceManager;
use crate::tracer;

const SYNC_TIME_GAP: Duration = Duration::from_secs(1);
const LOCK_CLEANER_TIME_GAP: Duration = Duration::from_secs(10 * 60);
const DETAIL_SYNC_TIME_GAP: Duration = Duration::from_secs(1);

/// One item of the role-change stream. Redeliveries are tolerated:
/// promotion while already master, or demotion while already slave, are
/// no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleToken {
    Master,
    Slave,
    Unknown,
}

pub type RoleStream = futures::stream::BoxStream<'static, RoleToken>;

/// The external leader-election collaborator, reached through a narrow
/// stream contract exposing a `BoxStream` of role tokens.
pub trait RoleSource: Send {
    fn subscribe(self: Box<Self>) -> RoleStream;
}

/// Runs the role loop until `cancel` fires, reacting to each token.
pub struct ManagerSupervisor {
    shared: Arc<Shared>,
    manager: Arc<ResourceManager>,
    brokers: Arc<BrokerSet>,
    details_tx: watch::Sender<ResourceDetails>,
    apps_tx: watch::Sender<Vec<AppDetails>>,
}

impl ManagerSupervisor {
    pub fn new(shared: Arc<Shared>, manager: Arc<ResourceManager>, brokers: Arc<BrokerSet>) -> Self {
        let (details_tx, _) = watch::channel(ResourceDetails::default());
        let (apps_tx, _) = watch::channel(Vec::new());
        ManagerSupervisor {
            shared,
            manager,
            brokers,
            details_tx,
            apps_tx,
        }
    }

    pub fn subscribe_details(&self) -> watch::Receiver<ResourceDetails> {
        self.details_tx.subscribe()
    }

    pub fn subscribe_apps(&self) -> watch::Receiver<Vec<AppDetails>> {
        self.apps_tx.subscribe()
    }

    /// Consumes role tokens until the source stream ends or `shutdown`
    /// fires.
    pub async fn run(self: Arc<Self>, mut roles: RoleStream, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.demote().await;
                    return;
                }
                token = roles.next() => {
                    match token {
                        Some(token) => self.handle_token(token).await,
                        None => {
                            self.demote().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_token(self: &Arc<Self>, token: RoleToken) {
        match token {
            RoleToken::Master => self.promote().await,
            RoleToken::Slave | RoleToken::Unknown => self.demote().await,
        }
    }

    async fn promote(self: &Arc<Self>) {
        if self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        let deploying = match self.manager.recover().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "recover() failed on promotion, staying slave");
                return;
            }
        };
        self.shared.running.store(true, Ordering::SeqCst);
        let scope = self.shared.open_new_scope();

        for resource_id in deploying {
            tracer::spawn_tracer(self.manager.clone(), resource_id, scope.clone());
        }

        self.spawn_sync_ticker(scope.clone());
        self.spawn_lock_cleaner(scope.clone());
        self.spawn_broker_checker(scope.clone());
        self.spawn_detail_syncs(scope);

        tracing::info!("promoted to master role");
    }

    async fn demote(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.close_scope();
        tracing::info!("demoted from master role");
    }

    fn spawn_sync_ticker(self: &Arc<Self>, cancel: CancellationToken) {
        let shared = self.shared.clone();
        crm_ore::task::spawn(
            || "sync-ticker",
            async move {
                let mut ticker = tokio::time::interval(SYNC_TIME_GAP);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    match shared.operator.get_resource(&shared.cluster_id).await {
                        Ok(nodes) => {
                            shared.pool.update_resources(
                                nodes.into_iter().map(|n| (Condition::new(n.city, n.platform), n.total_instance)),
                            );
                        }
                        Err(e) => tracing::warn!(error = %e, "get_resource failed, retrying next tick"),
                    }
                }
            },
        );
    }

    fn spawn_lock_cleaner(self: &Arc<Self>, cancel: CancellationToken) {
        let shared = self.shared.clone();
        crm_ore::task::spawn(
            || "lock-cleaner",
            async move {
                let mut ticker = tokio::time::interval(LOCK_CLEANER_TIME_GAP);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    shared.locks.reap().await;
                }
            },
        );
    }

    fn spawn_broker_checker(self: &Arc<Self>, cancel: CancellationToken) {
        let brokers = self.brokers.clone();
        crm_ore::task::spawn(|| "broker-checker", async move { brokers.run(cancel).await });
    }

    fn spawn_detail_syncs(self: &Arc<Self>, cancel: CancellationToken) {
        let shared = self.shared.clone();
        let details_tx = self.details_tx.clone();
        let rsc_cancel = cancel.clone();
        crm_ore::task::spawn(
            || "rsc-detail-sync",
            async move {
                let mut ticker = tokio::time::interval(DETAIL_SYNC_TIME_GAP);
                loop {
                    tokio::select! {
                        _ = rsc_cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    let _ = details_tx.send(ResourceDetails {
                        blocks: shared.pool.get_detail(),
                        stats: shared.pool.get_stats(),
                    });
                }
            },
        );

        let shared = self.shared.clone();
        let apps_tx = self.apps_tx.clone();
        crm_ore::task::spawn(
            || "app-detail-sync",
            async move {
                let mut ticker = tokio::time::interval(DETAIL_SYNC_TIME_GAP);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    let apps: Vec<AppDetails> = shared
                        .registered
                        .iter()
                        .filter_map(|entry| AppDetails::from_row(entry.value()))
                        .collect();
                    let _ = apps_tx.send(apps);
                }
            },
        );
    }
}
