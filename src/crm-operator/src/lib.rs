//! The capability set the core consumes from a pluggable container/cluster
//! backend (Mesos, Kubernetes, DC-Mac, ...). No backend-specific type ever
//! crosses this boundary; see `OperatorBackend` for the tagged sum over
//! concrete backends.

mod mock;
mod types;

pub use mock::MockOperator;
pub use types::*;

use async_trait::async_trait;

/// Capabilities the resource manager core needs from any backend.
///
/// Errors are intentionally coarse: the core distinguishes only success,
/// not-found, and an opaque backend failure, surfaced to callers as
/// success / not-found only.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Current node capacity and labels for `cluster_id`. Polled by the
    /// pool's `sync` ticker every `syncTimeGap`.
    async fn get_resource(&self, cluster_id: &str) -> Result<Vec<NodeInfo>, OperatorError>;

    /// Creates a service with exactly `spec.instance` replicas.
    async fn launch_server(&self, cluster_id: &str, spec: LaunchSpec) -> Result<(), OperatorError>;

    /// Resizes an already-deployed service to `target_instance` replicas.
    async fn scale_server(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
        target_instance: u32,
    ) -> Result<(), OperatorError>;

    /// Current observed status of a deployed service.
    async fn get_server_status(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<ServerStatus, OperatorError>;

    /// Tears a service down. Idempotent: releasing an already-gone service
    /// is not an error from the core's point of view (surfaced as
    /// `OperatorError::NotFound`, which callers treat as success).
    async fn release_server(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), OperatorError>;

    /// Whether `Launch` must go through the broker set rather than reserve
    /// pool instances directly (true only for the DC-Mac variant).
    fn requires_broker(&self) -> bool {
        false
    }
}

/// A tagged sum over the concrete backends the core can be wired to.
/// Keeps backend-specific types out of the state machine and the store:
/// callers construct one of these and hand it to the manager as
/// `Arc<dyn Operator>`.
pub enum OperatorBackend {
    Mesos(Box<dyn Operator>),
    Kubernetes(Box<dyn Operator>),
    DcMac(Box<dyn Operator>),
}

impl OperatorBackend {
    pub fn into_inner(self) -> Box<dyn Operator> {
        match self {
            OperatorBackend::Mesos(o) | OperatorBackend::Kubernetes(o) | OperatorBackend::DcMac(o) => o,
        }
    }
}
