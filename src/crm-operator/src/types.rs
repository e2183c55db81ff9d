use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A snapshot of one node-selector bucket's capacity, as reported by
/// `get_resource`. `city`/`platform` are the attribute pair the Node-Info
/// Pool buckets instances by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub city: String,
    pub platform: String,
    pub total_instance: u32,
}

/// Parameters for `Operator::launch_server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub name: String,
    pub namespace: String,
    pub city: String,
    pub platform: String,
    pub env: BTreeMap<String, String>,
    /// Named port -> protocol (e.g. "grpc" -> "tcp").
    pub ports: BTreeMap<String, String>,
    /// Named volume -> mount path.
    pub volumes: BTreeMap<String, String>,
    pub image: String,
    pub instance: u32,
}

/// Coarse lifecycle state the backend reports for a deployed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Staging,
    Running,
    Failed,
}

impl ServerState {
    /// True when the backend considers the deploy finished, one way or
    /// another — the signal the Tracer and `freshDeployingStatus` use to
    /// stop polling / release the remaining reservation.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServerState::Running | ServerState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub status: ServerState,
    pub current_instances: u32,
}

/// Opaque backend failures. The core distinguishes only success / not-found;
/// anything else is `Backend` and treated as a hard failure of the calling
/// operation.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("resource not found on backend")]
    NotFound,
    #[error("operator backend error: {0}")]
    Backend(String),
}
