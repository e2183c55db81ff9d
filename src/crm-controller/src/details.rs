//! Published read-only snapshots, refreshed every second by the
//! supervisor's detail-sync tickers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pool::{BlockDetail, PoolStats};
use crm_stash::ResourceStatus;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceDetails {
    pub blocks: Vec<BlockDetail>,
    pub stats: PoolStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppDetails {
    pub resource_id: String,
    pub broker_resource_id: String,
    pub broker_name: String,
    pub broker_sold: bool,
    pub user: String,
    pub status: String,
    pub image: String,
    pub create_time: DateTime<Utc>,
    pub request_instance: u32,
    pub no_ready_instance: u32,
    pub label: String,
}

impl AppDetails {
    pub fn from_row(row: &crm_stash::ResourceRow) -> Option<Self> {
        if row.status == ResourceStatus::Released {
            return None;
        }
        Some(AppDetails {
            resource_id: row.resource_id.clone(),
            broker_resource_id: row.broker_resource_id.clone(),
            broker_name: row.broker_name.clone(),
            broker_sold: row.broker_sold,
            user: row.user.clone(),
            status: row.status.as_str().to_string(),
            image: row.param.image.clone(),
            create_time: row.created_at,
            request_instance: row.request_instance,
            no_ready_instance: row.no_ready_instance,
            label: row.param.city.clone(),
        })
    }
}
