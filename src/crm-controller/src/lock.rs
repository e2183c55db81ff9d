//! Fine-grained per-resource locking that coexists with the background
//! reconciliation loops.
//!
//! A two-level lock: a `RwLock` guards the map itself, and each entry owns
//! its own mutex. Lookups take the read lock; only a first-time insert
//! needs the write lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

const REAP_AFTER: Duration = Duration::from_secs(24 * 60 * 60);
const WARN_HOLD_THRESHOLD: Duration = Duration::from_secs(1);

struct LockEntry {
    create_at: Instant,
    last_hold: StdMutex<Instant>,
    mutex: Arc<Mutex<()>>,
}

impl LockEntry {
    fn new(now: Instant) -> Self {
        LockEntry {
            create_at: now,
            last_hold: StdMutex::new(now),
            mutex: Arc::new(Mutex::new(())),
        }
    }
}

/// A concurrent map of sharded mutexes keyed by resource id, with lazy
/// creation and a 24h reap policy.
#[derive(Default)]
pub struct LockTable {
    entries: RwLock<HashMap<String, Arc<LockEntry>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `resource_id` for the duration of the returned
    /// guard. Every mutating state-machine operation holds this for its
    /// entire duration.
    pub async fn acquire(&self, resource_id: &str) -> LockGuard {
        let entry = {
            let read = self.entries.read().await;
            if let Some(entry) = read.get(resource_id) {
                entry.clone()
            } else {
                drop(read);
                let mut write = self.entries.write().await;
                write
                    .entry(resource_id.to_string())
                    .or_insert_with(|| Arc::new(LockEntry::new(Instant::now())))
                    .clone()
            }
        };
        *entry.last_hold.lock().unwrap() = Instant::now();
        let guard = entry.mutex.clone().lock_owned().await;
        LockGuard {
            resource_id: resource_id.to_string(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    /// Reaps entries whose `create_at` is more than 24h old. Never blocks a
    /// user operation longer than a single lock acquisition: this only
    /// takes the table's write lock, never an individual entry's.
    pub async fn reap(&self) {
        let now = Instant::now();
        let mut write = self.entries.write().await;
        write.retain(|_, entry| now.duration_since(entry.create_at) < REAP_AFTER);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Held for the duration of one state-machine operation. Warns on drop if
/// the critical section ran longer than a second — a diagnostic signal
/// that operator I/O or a DB write stalled inside the lock.
pub struct LockGuard {
    resource_id: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let held = self.acquired_at.elapsed();
        if held > WARN_HOLD_THRESHOLD {
            tracing::warn!(
                resource_id = %self.resource_id,
                held_ms = held.as_millis() as u64,
                "resource lock held longer than 1s",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_resource_serialises_access() {
        let table = Arc::new(LockTable::new());
        let order = Arc::new(StdMutex::new(Vec::new()));

        let t1 = {
            let table = table.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = table.acquire("r1").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                order.lock().unwrap().push(1);
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let t2 = {
            let table = table.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = table.acquire("r1").await;
                order.lock().unwrap().push(2);
            })
        };
        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn distinct_resources_run_concurrently() {
        let table = LockTable::new();
        let _g1 = table.acquire("a").await;
        let _g2 = table.acquire("b").await;
        assert_eq!(table.len().await, 2);
    }
}
