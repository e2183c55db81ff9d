//! The node-info accounting pool: an in-memory map from attribute-bucket
//! ("block") to `{total, free, noReady}` counts, refreshed from the
//! operator every `syncTimeGap` and drawn down by `Launch`/`Scale`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::CrmError;

/// The attribute pair a block is keyed by. `launch` and `scale` both key
/// reservations on this same `{city, platform}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Condition {
    pub city: String,
    pub platform: String,
}

impl Condition {
    pub fn new(city: impl Into<String>, platform: impl Into<String>) -> Self {
        Condition {
            city: city.into(),
            platform: platform.into(),
        }
    }

    /// The block key this condition maps to: `"<city>/<platform>"`.
    pub fn block_key(&self) -> String {
        format!("{}/{}", self.city, self.platform)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockState {
    /// Last capacity the operator reported for this block.
    total: i64,
    /// Capacity this pool considers unreserved. May go transiently negative
    /// right after a recovery re-establishes outstanding reservations ahead
    /// of the next snapshot — see `recover_no_ready_block`.
    free: i64,
    /// Capacity reserved for an in-flight deploy, not yet confirmed ready.
    no_ready: i64,
}

/// A snapshot of one block's accounting, for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDetail {
    pub key: String,
    pub total: i64,
    pub free: i64,
    pub no_ready: i64,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub blocks: usize,
    pub total: i64,
    pub free: i64,
    pub no_ready: i64,
}

pub struct NodeInfoPool {
    blocks: DashMap<String, BlockState>,
    last_update: watch::Sender<DateTime<Utc>>,
}

impl Default for NodeInfoPool {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeInfoPool {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DateTime::<Utc>::MIN_UTC);
        NodeInfoPool {
            blocks: DashMap::new(),
            last_update: tx,
        }
    }

    /// Reconciles this block's totals from a fresh operator snapshot. Only
    /// the *change* in reported total is folded into `free`: a block's
    /// `no_ready` reservation is owned entirely by
    /// `get_free_instances`/`release_no_ready_instance`, never touched here.
    pub fn update_resources(&self, totals: impl IntoIterator<Item = (Condition, u32)>) {
        for (condition, total_instance) in totals {
            let key = condition.block_key();
            let mut entry = self.blocks.entry(key).or_default();
            let delta = i64::from(total_instance) - entry.total;
            entry.total = i64::from(total_instance);
            entry.free += delta;
        }
        let _ = self.last_update.send(Utc::now());
    }

    /// Implements the §4.B protocol: select the block, let `filter_fn`
    /// decide how much of the available free capacity to take, and commit
    /// the reservation atomically.
    pub fn get_free_instances(
        &self,
        condition: &Condition,
        filter_fn: impl FnOnce(u32) -> Result<u32, CrmError>,
    ) -> Result<(u32, String), CrmError> {
        let key = condition.block_key();
        let mut entry = self.blocks.entry(key.clone()).or_default();
        let available = entry.free.max(0) as u32;
        let granted = filter_fn(available)?;
        entry.free -= i64::from(granted);
        entry.no_ready += i64::from(granted);
        Ok((granted, key))
    }

    /// `Scale`'s variant of the §4.B protocol: `filter_fn` returns a signed
    /// delta. A positive delta reserves capacity exactly like
    /// `get_free_instances`; a non-positive delta (scaling down, or no
    /// change) touches nothing — the capacity a shrinking resource gives up
    /// was never held in `free`/`no_ready` to begin with (it graduated out
    /// once the resource reached `running`), so there is nothing to credit
    /// back here. The backend's own next snapshot reflects the reduction.
    pub fn get_scale_delta(
        &self,
        condition: &Condition,
        filter_fn: impl FnOnce(u32) -> Result<i64, CrmError>,
    ) -> Result<(i64, String), CrmError> {
        let key = condition.block_key();
        let mut entry = self.blocks.entry(key.clone()).or_default();
        let available = entry.free.max(0) as u32;
        let delta = filter_fn(available)?;
        if delta > 0 {
            entry.free -= delta;
            entry.no_ready += delta;
        }
        Ok((delta, key))
    }

    /// Re-establishes `no_ready` for a resource recovered from the store
    /// ahead of the next `update_resources` call so that reservation
    /// isn't double-counted once the snapshot catches up.
    pub fn recover_no_ready_block(&self, key: &str, n: u32) {
        let mut entry = self.blocks.entry(key.to_string()).or_default();
        entry.free -= i64::from(n);
        entry.no_ready += i64::from(n);
    }

    /// Releases a reservation back to `free`, but only once a snapshot
    /// taken after `reserved_at` has landed — releasing earlier would
    /// double count against the snapshot that hasn't yet observed the
    /// backend's reduced capacity.
    pub async fn release_no_ready_instance(&self, key: &str, n: u32, reserved_at: DateTime<Utc>) {
        if n == 0 {
            return;
        }
        let mut rx = self.last_update.subscribe();
        while *rx.borrow() <= reserved_at {
            if rx.changed().await.is_err() {
                // The pool was dropped; nothing left to release into.
                return;
            }
        }
        let mut entry = self.blocks.entry(key.to_string()).or_default();
        entry.no_ready -= i64::from(n);
        entry.free += i64::from(n);
    }

    pub fn get_last_update_time(&self) -> DateTime<Utc> {
        *self.last_update.borrow()
    }

    pub fn get_stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            blocks: self.blocks.len(),
            ..PoolStats::default()
        };
        for entry in self.blocks.iter() {
            stats.total += entry.total;
            stats.free += entry.free;
            stats.no_ready += entry.no_ready;
        }
        stats
    }

    pub fn get_detail(&self) -> Vec<BlockDetail> {
        self.blocks
            .iter()
            .map(|entry| BlockDetail {
                key: entry.key().clone(),
                total: entry.total,
                free: entry.free,
                no_ready: entry.no_ready,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_draws_down_free_block() {
        let pool = NodeInfoPool::new();
        let cond = Condition::new("sh", "linux");
        pool.update_resources([(cond.clone(), 10)]);
        let (granted, key) = pool
            .get_free_instances(&cond, |available| Ok(available.min(3)))
            .unwrap();
        assert_eq!(granted, 3);
        assert_eq!(key, "sh/linux");
        let detail = pool.get_detail();
        let block = detail.iter().find(|b| b.key == "sh/linux").unwrap();
        assert_eq!(block.free, 7);
        assert_eq!(block.no_ready, 3);
    }

    #[test]
    fn filter_rejecting_propagates_not_enough_resources() {
        let pool = NodeInfoPool::new();
        let cond = Condition::new("sh", "linux");
        pool.update_resources([(cond.clone(), 2)]);
        let result = pool.get_free_instances(&cond, |available| {
            if available < 5 {
                Err(CrmError::NotEnoughResources("sh/linux".into()))
            } else {
                Ok(5)
            }
        });
        assert!(matches!(result, Err(CrmError::NotEnoughResources(_))));
    }

    #[tokio::test]
    async fn release_waits_for_snapshot_advance() {
        let pool = NodeInfoPool::new();
        let cond = Condition::new("sh", "linux");
        pool.update_resources([(cond.clone(), 5)]);
        let reserved_at = pool.get_last_update_time();
        let (granted, key) = pool
            .get_free_instances(&cond, |available| Ok(available.min(5)))
            .unwrap();
        assert_eq!(granted, 5);
        assert_eq!(pool.get_detail()[0].free, 0);

        let pool = std::sync::Arc::new(pool);
        let pool2 = pool.clone();
        let key2 = key.clone();
        let release = tokio::spawn(async move {
            pool2.release_no_ready_instance(&key2, granted, reserved_at).await;
        });

        // Give the waiter a chance to park on the watch channel before we
        // advance it; release must never fire before this happens.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(pool.get_detail()[0].free, 0);

        pool.update_resources([(cond.clone(), 5)]);
        release.await.unwrap();
        assert_eq!(pool.get_detail()[0].free, 5);
        assert_eq!(pool.get_detail()[0].no_ready, 0);
    }
}
