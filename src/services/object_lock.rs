//! Keyed async mutex.
//!
//! Operations on one key run one at a time, in the order they asked for the
//! lock (tokio's mutex is FIFO). Different keys never contend. A key's entry
//! is removed from the map as soon as no guard or waiter refers to it.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    /// Guards plus waiters, including ones whose lock future was dropped
    /// before it resolved.
    users: usize,
}

type LockMap = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Clone, Default)]
pub struct ObjectLocks {
    map: LockMap,
}

/// Counts one user of a key for as long as it lives.
struct KeyUse {
    map: LockMap,
    key: String,
}

impl KeyUse {
    fn enter(map: &LockMap, key: &str) -> (Self, Arc<AsyncMutex<()>>) {
        let mut slots = map.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            mutex: Arc::new(AsyncMutex::new(())),
            users: 0,
        });
        slot.users += 1;
        let mutex = slot.mutex.clone();
        let key_use = Self {
            map: map.clone(),
            key: key.to_string(),
        };
        (key_use, mutex)
    }
}

impl Drop for KeyUse {
    fn drop(&mut self) {
        let mut slots = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if let Entry::Occupied(mut slot) = slots.entry(std::mem::take(&mut self.key)) {
            slot.get_mut().users -= 1;
            if slot.get().users == 0 {
                slot.remove();
            }
        }
    }
}

/// Held for the duration of one critical section on a key.
pub struct ObjectGuard {
    // Field order matters: the mutex is released before the use is dropped,
    // so the slot cannot be replaced while it is still held.
    _guard: OwnedMutexGuard<()>,
    _use: KeyUse,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> ObjectGuard {
        let (key_use, mutex) = KeyUse::enter(&self.map, key);
        let guard = mutex.lock_owned().await;
        ObjectGuard {
            _guard: guard,
            _use: key_use,
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn active_keys(&self) -> usize {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
