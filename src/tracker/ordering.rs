use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per alert message, so events touching the same alert
/// run one at a time in arrival order while other alerts proceed.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<u64, Arc<AsyncMutex<()>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: u64) -> OwnedMutexGuard<()> {
        // Only the map holds idle slots.
        self.locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        let slot = self.locks.entry(key).or_default().clone();
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}
