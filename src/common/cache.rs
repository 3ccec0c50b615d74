use log::debug;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;

type EvictFn<K, V> = Box<dyn Fn(&K, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    last_active: Instant,
}

struct Shared<K, V> {
    timeout: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    on_evict: EvictFn<K, V>,
}

/// Time-indexed cache with idle eviction.
///
/// Every `get` refreshes the entry's last-access time. A background task
/// sweeps on a fixed interval and evicts entries idle for at least
/// `timeout`, handing the evicted value to the `on_evict` callback. The
/// sweep interval is only a polling granularity; it never shortens an
/// entry's lifetime below `timeout`.
///
/// Handles are cheap clones sharing one map; the sweeper stops when the
/// last handle is dropped or `destroy` is called.
pub struct TimedCache<K, V> {
    shared: Arc<Shared<K, V>>,
    sweeper: Arc<Sweeper>,
}

struct Sweeper(JoinHandle<()>);

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<K, V> Clone for TimedCache<K, V> {
    fn clone(&self) -> Self {
        TimedCache {
            shared: self.shared.clone(),
            sweeper: self.sweeper.clone(),
        }
    }
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F>(timeout: Duration, sweep_interval: Duration, on_evict: F) -> TimedCache<K, V>
    where
        F: Fn(&K, V) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            timeout,
            entries: Mutex::new(HashMap::new()),
            on_evict: Box::new(on_evict),
        });
        let weak: Weak<Shared<K, V>> = Arc::downgrade(&shared);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(shared) => sweep(&shared),
                    None => break,
                }
            }
        });
        TimedCache {
            shared,
            sweeper: Arc::new(Sweeper(handle)),
        }
    }

    pub fn set(&self, key: K, value: V) {
        let mut entries = self.shared.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                last_active: Instant::now(),
            },
        );
    }

    /// Returns a clone of the cached value, refreshing its last-access
    /// time.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.shared.entries.lock().unwrap();
        entries.get_mut(key).map(|e| {
            e.last_active = Instant::now();
            e.value.clone()
        })
    }

    #[allow(dead_code)]
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.shared.entries.lock().unwrap();
        entries.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the background sweeper. Entries already in the map stay
    /// until removed by hand.
    pub fn destroy(&self) {
        self.sweeper.0.abort();
    }
}

fn sweep<K, V>(shared: &Shared<K, V>)
where
    K: Eq + Hash + Clone,
{
    let now = Instant::now();
    let mut evicted = Vec::new();
    {
        let mut entries = shared.entries.lock().unwrap();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_active) >= shared.timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(e) = entries.remove(&key) {
                evicted.push((key, e.value));
            }
        }
    }
    if !evicted.is_empty() {
        debug!("{} sessions swept", evicted.len());
    }
    // Callback runs outside the lock so it may touch the cache again.
    for (key, value) in evicted {
        (shared.on_evict)(&key, value);
    }
}
