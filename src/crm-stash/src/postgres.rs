use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};

use crate::{ResourceFilter, ResourceParam, ResourceRow, ResourceStatus, ResourceStore, StashError};

/// A Postgres-backed `ResourceStore` built directly on `tokio-postgres`.
pub struct PostgresResourceStore {
    client: Client,
}

impl PostgresResourceStore {
    /// Connects to `conninfo` and spawns the connection's background I/O
    /// driver. When `ensure_table` is true (the default unless disabled by
    /// configuration), idempotently creates the `resource` table.
    pub async fn connect(conninfo: &str, ensure_table: bool) -> Result<Self, StashError> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
            .await
            .map_err(|e| StashError::Backend(e.into()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("resource store connection error: {e}");
            }
        });
        let store = PostgresResourceStore { client };
        if ensure_table {
            store.ensure_table().await?;
        }
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<(), StashError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS resource (
                    resource_id text PRIMARY KEY,
                    \"user\" text NOT NULL,
                    param jsonb NOT NULL,
                    resource_block_key text NOT NULL DEFAULT '',
                    no_ready_instance integer NOT NULL DEFAULT 0,
                    request_instance integer NOT NULL DEFAULT 0,
                    status integer NOT NULL,
                    broker_resource_id text NOT NULL DEFAULT '',
                    broker_name text NOT NULL DEFAULT '',
                    broker_sold boolean NOT NULL DEFAULT false,
                    created_at timestamptz NOT NULL
                )",
            )
            .await
            .map_err(|e| StashError::Backend(e.into()))
    }

    fn row_to_resource(row: &tokio_postgres::Row) -> Result<ResourceRow, StashError> {
        let param_json: serde_json::Value = row.get("param");
        let param: ResourceParam =
            serde_json::from_value(param_json).map_err(|e| StashError::Backend(e.into()))?;
        let status: i32 = row.get("status");
        Ok(ResourceRow {
            resource_id: row.get("resource_id"),
            user: row.get("user"),
            param,
            resource_block_key: row.get("resource_block_key"),
            no_ready_instance: row.get::<_, i32>("no_ready_instance") as u32,
            request_instance: row.get::<_, i32>("request_instance") as u32,
            status: status_from_i32(status)?,
            broker_resource_id: row.get("broker_resource_id"),
            broker_name: row.get("broker_name"),
            broker_sold: row.get("broker_sold"),
            created_at: row.get("created_at"),
        })
    }
}

fn status_to_i32(status: ResourceStatus) -> i32 {
    match status {
        ResourceStatus::Init => 0,
        ResourceStatus::Deploying => 1,
        ResourceStatus::Running => 2,
        ResourceStatus::Released => 3,
        ResourceStatus::Deleting => 4,
    }
}

fn status_from_i32(v: i32) -> Result<ResourceStatus, StashError> {
    Ok(match v {
        0 => ResourceStatus::Init,
        1 => ResourceStatus::Deploying,
        2 => ResourceStatus::Running,
        3 => ResourceStatus::Released,
        4 => ResourceStatus::Deleting,
        other => {
            return Err(StashError::Backend(anyhow::anyhow!(
                "unknown resource status {other}"
            )))
        }
    })
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    async fn create(&self, row: ResourceRow) -> Result<(), StashError> {
        let param_json =
            serde_json::to_value(&row.param).map_err(|e| StashError::Backend(e.into()))?;
        let result = self
            .client
            .execute(
                "INSERT INTO resource (
                    resource_id, \"user\", param, resource_block_key, no_ready_instance,
                    request_instance, status, broker_resource_id, broker_name, broker_sold,
                    created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                &[
                    &row.resource_id,
                    &row.user,
                    &param_json,
                    &row.resource_block_key,
                    &(row.no_ready_instance as i32),
                    &(row.request_instance as i32),
                    &status_to_i32(row.status),
                    &row.broker_resource_id,
                    &row.broker_name,
                    &row.broker_sold,
                    &row.created_at,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) => {
                Err(StashError::AlreadyExists(row.resource_id))
            }
            Err(e) => Err(StashError::Backend(e.into())),
        }
    }

    async fn put(&self, row: ResourceRow) -> Result<(), StashError> {
        let param_json =
            serde_json::to_value(&row.param).map_err(|e| StashError::Backend(e.into()))?;
        self.client
            .execute(
                "INSERT INTO resource (
                    resource_id, \"user\", param, resource_block_key, no_ready_instance,
                    request_instance, status, broker_resource_id, broker_name, broker_sold,
                    created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (resource_id) DO UPDATE SET
                    \"user\" = EXCLUDED.user,
                    param = EXCLUDED.param,
                    resource_block_key = EXCLUDED.resource_block_key,
                    no_ready_instance = EXCLUDED.no_ready_instance,
                    request_instance = EXCLUDED.request_instance,
                    status = EXCLUDED.status,
                    broker_resource_id = EXCLUDED.broker_resource_id,
                    broker_name = EXCLUDED.broker_name,
                    broker_sold = EXCLUDED.broker_sold",
                &[
                    &row.resource_id,
                    &row.user,
                    &param_json,
                    &row.resource_block_key,
                    &(row.no_ready_instance as i32),
                    &(row.request_instance as i32),
                    &status_to_i32(row.status),
                    &row.broker_resource_id,
                    &row.broker_name,
                    &row.broker_sold,
                    &row.created_at,
                ],
            )
            .await
            .map_err(|e| StashError::Backend(e.into()))?;
        Ok(())
    }

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceRow>, StashError> {
        let row = self
            .client
            .query_opt(
                "SELECT * FROM resource WHERE resource_id = $1",
                &[&resource_id],
            )
            .await
            .map_err(|e| StashError::Backend(e.into()))?;
        row.as_ref().map(Self::row_to_resource).transpose()
    }

    async fn list(&self, filter: ResourceFilter) -> Result<Vec<ResourceRow>, StashError> {
        let rows = if filter.statuses.is_empty() {
            self.client
                .query("SELECT * FROM resource", &[])
                .await
                .map_err(|e| StashError::Backend(e.into()))?
        } else {
            let statuses: Vec<i32> = filter.statuses.iter().copied().map(status_to_i32).collect();
            self.client
                .query("SELECT * FROM resource WHERE status = ANY($1)", &[&statuses])
                .await
                .map_err(|e| StashError::Backend(e.into()))?
        };
        let mut resources = rows
            .iter()
            .map(Self::row_to_resource)
            .collect::<Result<Vec<_>, _>>()?;
        if filter.limit >= 0 {
            resources.truncate(filter.limit as usize);
        }
        Ok(resources)
    }

    async fn delete(&self, resource_id: &str) -> Result<(), StashError> {
        self.client
            .execute("DELETE FROM resource WHERE resource_id = $1", &[&resource_id])
            .await
            .map_err(|e| StashError::Backend(e.into()))?;
        Ok(())
    }
}
