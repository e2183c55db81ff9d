//! Thin binary wiring `crm-controller` to a concrete operator backend, a
//! resource store, and a role-change source. Real leader election is an
//! external collaborator; this binary ships only the default
//! `StaticRoleSource` for single-node/standalone operation.

mod args;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use args::{Cli, OperatorKind};
use crm_controller::{BrokerSet, ManagerSupervisor, ResourceManager, RoleSource, RoleStream, RoleToken, Shared};
use crm_operator::{MockOperator, Operator};
use crm_stash::{InMemoryResourceStore, ResourceStore};

/// Immediately and permanently yields `Master` — the default, swappable
/// role source for standalone operation.
struct StaticRoleSource;

impl RoleSource for StaticRoleSource {
    fn subscribe(self: Box<Self>) -> RoleStream {
        stream::once(async { RoleToken::Master }).boxed()
    }
}

fn build_operator(kind: OperatorKind) -> Result<Arc<dyn Operator>> {
    match kind {
        OperatorKind::Mock => Ok(Arc::new(MockOperator::new(vec![]))),
        OperatorKind::Mesos | OperatorKind::Kubernetes | OperatorKind::DcMac => {
            bail!("{kind:?} operator backend is not implemented in this build; pass --operator mock")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let operator = build_operator(cli.operator)?;
    let store: Arc<dyn ResourceStore> = match &cli.database_url {
        Some(conninfo) => Arc::new(crm_stash::PostgresResourceStore::connect(conninfo, !cli.no_ensure_table).await?),
        None => {
            tracing::warn!("no --database-url given, running with an in-memory (non-durable) resource store");
            Arc::new(InMemoryResourceStore::new())
        }
    };

    let shared = Arc::new(Shared::new(cli.cluster_id.clone(), store, operator));
    let brokers = Arc::new(BrokerSet::new(shared.clone()));
    let manager = ResourceManager::new(shared.clone(), brokers.clone());
    let supervisor = Arc::new(ManagerSupervisor::new(shared, manager, brokers));

    let roles = Box::new(StaticRoleSource).subscribe();
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        signal_token.cancel();
    });

    supervisor.run(roles, shutdown).await;
    Ok(())
}
