//! Durable metadata storage for `resource` rows: a narrow, typed CRUD
//! contract backed by Postgres, with an in-memory double for tests.

mod memory;
mod postgres;
mod types;

pub use memory::InMemoryResourceStore;
pub use postgres::PostgresResourceStore;
pub use types::*;

use async_trait::async_trait;

/// Durable CRUD for `Resource` rows. The store performs no schema migration;
/// `PostgresResourceStore::connect` may ensure the table exists idempotently
/// unless configured not to.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Inserts a brand new row. Errors with `StashError::AlreadyExists` if
    /// `resource_id` is already present.
    async fn create(&self, row: ResourceRow) -> Result<(), StashError>;

    /// Upserts a row: replaces it if present, inserts it otherwise.
    async fn put(&self, row: ResourceRow) -> Result<(), StashError>;

    /// Fetches a single row by id.
    async fn get(&self, resource_id: &str) -> Result<Option<ResourceRow>, StashError>;

    /// Lists rows matching `filter`. `filter.limit < 0` means unbounded.
    async fn list(&self, filter: ResourceFilter) -> Result<Vec<ResourceRow>, StashError>;

    /// Deletes a row outright (used once a resource is released and no
    /// longer needs to be recovered).
    async fn delete(&self, resource_id: &str) -> Result<(), StashError>;
}

/// Selects which rows `ResourceStore::list` returns.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    /// Empty means "any status".
    pub statuses: Vec<ResourceStatus>,
    /// Negative means unbounded.
    pub limit: i64,
}

impl ResourceFilter {
    pub fn unbounded(statuses: Vec<ResourceStatus>) -> Self {
        ResourceFilter { statuses, limit: -1 }
    }
}
