use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{ResourceFilter, ResourceRow, ResourceStore, StashError};

/// An in-memory `ResourceStore`, used by tests and by `--no-db` standalone
/// operation.
#[derive(Default)]
pub struct InMemoryResourceStore {
    rows: Mutex<BTreeMap<String, ResourceRow>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn create(&self, row: ResourceRow) -> Result<(), StashError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&row.resource_id) {
            return Err(StashError::AlreadyExists(row.resource_id));
        }
        rows.insert(row.resource_id.clone(), row);
        Ok(())
    }

    async fn put(&self, row: ResourceRow) -> Result<(), StashError> {
        self.rows.lock().await.insert(row.resource_id.clone(), row);
        Ok(())
    }

    async fn get(&self, resource_id: &str) -> Result<Option<ResourceRow>, StashError> {
        Ok(self.rows.lock().await.get(resource_id).cloned())
    }

    async fn list(&self, filter: ResourceFilter) -> Result<Vec<ResourceRow>, StashError> {
        let rows = self.rows.lock().await;
        let mut matched: Vec<ResourceRow> = rows
            .values()
            .filter(|row| filter.statuses.is_empty() || filter.statuses.contains(&row.status))
            .cloned()
            .collect();
        if filter.limit >= 0 {
            matched.truncate(filter.limit as usize);
        }
        Ok(matched)
    }

    async fn delete(&self, resource_id: &str) -> Result<(), StashError> {
        self.rows.lock().await.remove(resource_id);
        Ok(())
    }
}
