//! In-memory cache whose entries expire when not touched within a window.
//!
//! Used as a read cache in front of JSON records that are always written
//! through to disk, so an eviction only costs a fresh read. One background
//! task per cache does the sweeping; it stops once the cache is dropped.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tracing::trace;

struct Entry<V> {
    value: V,
    touched: Instant,
}

type Entries<K, V> = Mutex<HashMap<K, Entry<V>>>;

pub struct WindowedCache<K, V> {
    entries: Arc<Entries<K, V>>,
    window: Duration,
}

impl<K, V> WindowedCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create the cache and, when called inside a tokio runtime, start its
    /// sweeper.
    pub fn new(window: Duration) -> Self {
        let cache = Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            window,
        };
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(sweep_loop(Arc::downgrade(&cache.entries), window));
        }
        cache
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        entry.touched = Instant::now();
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().insert(
            key,
            Entry {
                value,
                touched: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) {
        self.lock().remove(key);
    }

    pub fn remove_matching(&self, pred: impl Fn(&K) -> bool) {
        self.lock().retain(|k, _| !pred(k));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict entries not touched within the window before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        sweep_entries(&self.entries, now, self.window)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn sweep_entries<K: Eq + Hash, V>(entries: &Entries<K, V>, now: Instant, window: Duration) -> usize {
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    entries.retain(|_, e| now.saturating_duration_since(e.touched) < window);
    before - entries.len()
}

async fn sweep_loop<K: Eq + Hash, V>(entries: Weak<Entries<K, V>>, window: Duration) {
    let mut ticker = tokio::time::interval(window.max(Duration::from_millis(10)));
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(live) = entries.upgrade() else {
            break;
        };
        let evicted = sweep_entries(&live, Instant::now(), window);
        if evicted > 0 {
            trace!("evicted {} idle cache entries", evicted);
        }
    }
}
