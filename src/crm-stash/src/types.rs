use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request parameters for a resource. Encoded as a single JSON column
/// (`param`) in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceParam {
    pub city: String,
    pub platform: String,
    pub env: BTreeMap<String, String>,
    /// Named port -> protocol.
    pub ports: BTreeMap<String, String>,
    /// Named volume -> mount path.
    pub volumes: BTreeMap<String, String>,
    pub image: String,
    /// Optional hint: prefer taking over a broker with this name.
    pub broker_name_hint: Option<String>,
    /// Passed through to the operator for the backend's own bookkeeping —
    /// a real launch call needs labels to select/filter the resources it
    /// creates.
    pub labels: BTreeMap<String, String>,
}

impl Default for ResourceParam {
    fn default() -> Self {
        ResourceParam {
            city: String::new(),
            platform: String::new(),
            env: BTreeMap::new(),
            ports: BTreeMap::new(),
            volumes: BTreeMap::new(),
            image: String::new(),
            broker_name_hint: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Lifecycle state of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Init,
    Deploying,
    Running,
    Released,
    Deleting,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Init => "init",
            ResourceStatus::Deploying => "deploying",
            ResourceStatus::Running => "running",
            ResourceStatus::Released => "released",
            ResourceStatus::Deleting => "deleting",
        }
    }
}

/// One row of the `resource` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRow {
    pub resource_id: String,
    pub user: String,
    pub param: ResourceParam,
    /// "" means unset: `status = init` implies `resource_block_key = ""`.
    pub resource_block_key: String,
    pub request_instance: u32,
    pub no_ready_instance: u32,
    pub status: ResourceStatus,
    /// "" unless this resource was satisfied by a broker takeover.
    pub broker_resource_id: String,
    /// "" unless this resource is itself a broker-owned spare.
    pub broker_name: String,
    pub broker_sold: bool,
    pub created_at: DateTime<Utc>,
}

impl ResourceRow {
    pub fn new_init(resource_id: String, user: String, param: ResourceParam, now: DateTime<Utc>) -> Self {
        ResourceRow {
            resource_id,
            user,
            param,
            resource_block_key: String::new(),
            request_instance: 0,
            no_ready_instance: 0,
            status: ResourceStatus::Init,
            broker_resource_id: String::new(),
            broker_name: String::new(),
            broker_sold: false,
            created_at: now,
        }
    }

    pub fn is_broker_backed(&self) -> bool {
        !self.broker_resource_id.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StashError {
    #[error("resource {0} already exists")]
    AlreadyExists(String),
    #[error("resource {0} not found")]
    NotFound(String),
    #[error("stash backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
