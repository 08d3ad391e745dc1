//! Byte-budgeted LRU cache with eviction notification
//!
//! Provides the in-memory tier of the resource cache. Entries are weighed in
//! bytes and the least recently used entries are evicted whenever the summed
//! weight exceeds the current budget. Every value leaving the cache for any
//! reason other than [`LruCache::take`] is reported to the eviction listener
//! exactly once, after the cache lock has been released.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Something whose retained memory can be estimated in bytes.
pub trait Weighted {
    /// Estimated size in bytes.
    fn weight(&self) -> usize;
}

/// Callback invoked with every evicted key/value pair.
pub type EvictionListener<K, V> = Arc<dyn Fn(&K, V) + Send + Sync>;

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries currently in cache
    pub item_count: usize,

    /// Summed weight of cached entries (bytes)
    pub bytes_used: usize,

    /// Current byte budget
    pub max_size: usize,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of entries evicted by the budget or removed explicitly
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.max_size as f64
        }
    }
}

struct Entry<V> {
    value: V,
    weight: usize,
    tick: u64,
}

/// Internal cache state
struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,

    /// Recency order: smallest tick is least recently used
    order: BTreeMap<u64, K>,

    next_tick: u64,
    initial_max_size: usize,
    max_size: usize,
    current_size: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            initial_max_size: max_size,
            max_size,
            current_size: 0,
            stats: CacheStats {
                max_size,
                ..Default::default()
            },
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Mark a key as most recently used
    fn touch(&mut self, key: &K) {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn detach(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.current_size -= entry.weight;
        Some(entry)
    }

    /// Evict least recently used entries until the cache fits in `size`
    fn trim_to_size(&mut self, size: usize, evicted: &mut Vec<(K, V)>) {
        while self.current_size > size {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.current_size -= entry.weight;
                self.stats.evictions += 1;
                evicted.push((key, entry.value));
            }
        }
        self.sync_stats();
    }

    fn sync_stats(&mut self) {
        self.stats.item_count = self.entries.len();
        self.stats.bytes_used = self.current_size;
        self.stats.max_size = self.max_size;
    }
}

/// Byte-budgeted LRU cache
///
/// Thread-safe; all public operations are mutually exclusive. Values are
/// handed out by clone, so `V` is normally a cheap handle such as an `Arc`.
///
/// # Example
///
/// ```
/// use pixelflow_cache::{LruCache, Weighted};
///
/// #[derive(Clone, PartialEq)]
/// struct Blob(Vec<u8>);
///
/// impl Weighted for Blob {
///     fn weight(&self) -> usize {
///         self.0.len()
///     }
/// }
///
/// let cache = LruCache::new(1024);
/// cache.put("a", Blob(vec![0; 600]));
/// cache.put("b", Blob(vec![0; 600])); // evicts "a"
///
/// assert!(!cache.contains(&"a"));
/// assert_eq!(cache.current_size(), 600);
/// ```
pub struct LruCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    listener: Mutex<Option<EvictionListener<K, V>>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Weighted + Clone + PartialEq,
{
    /// Create a cache with the given byte budget
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::new(max_size)),
            listener: Mutex::new(None),
        }
    }

    /// Set the callback that receives every evicted entry
    pub fn set_eviction_listener(&self, listener: EvictionListener<K, V>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Scale the budget relative to the size the cache was created with
    ///
    /// Shrinking the budget evicts immediately.
    ///
    /// # Panics
    ///
    /// Panics if `multiplier` is negative.
    pub fn set_size_multiplier(&self, multiplier: f32) {
        assert!(
            multiplier >= 0.0,
            "Size multiplier must be >= 0, got {}",
            multiplier
        );
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.max_size = (state.initial_max_size as f64 * multiplier as f64).round() as usize;
            let max_size = state.max_size;
            state.trim_to_size(max_size, &mut evicted);
        }
        self.notify(evicted);
    }

    /// Current byte budget
    pub fn max_size(&self) -> usize {
        self.state.lock().unwrap().max_size
    }

    /// Summed weight of all cached entries
    pub fn current_size(&self) -> usize {
        self.state.lock().unwrap().current_size
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Returns true if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check for a key without updating recency
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    /// Look up a value, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let value = state.entries.get(key).map(|entry| entry.value.clone());
        if value.is_some() {
            state.touch(key);
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        value
    }

    /// Store a value, returning the previous value for the key if there was one
    ///
    /// A value weighing at least the whole budget is never stored; it is
    /// reported to the eviction listener straight away and `None` is returned.
    /// A replaced value is reported unless it is equal to the new value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let weight = value.weight();
        let mut evicted = Vec::new();
        let previous = {
            let mut state = self.state.lock().unwrap();
            if weight >= state.max_size {
                drop(state);
                trace!(weight, "Rejected entry larger than the cache budget");
                self.notify(vec![(key, value)]);
                return None;
            }

            let previous = state.detach(&key);
            let tick = state.tick();
            state.current_size += weight;
            state.order.insert(tick, key.clone());
            let replaced_same = previous.as_ref().is_some_and(|old| old.value == value);
            state.entries.insert(key.clone(), Entry { value, weight, tick });

            let previous = previous.map(|old| old.value);
            if let Some(old) = &previous {
                if !replaced_same {
                    state.stats.evictions += 1;
                    evicted.push((key, old.clone()));
                }
            }

            let max_size = state.max_size;
            state.trim_to_size(max_size, &mut evicted);
            previous
        };
        self.notify(evicted);
        previous
    }

    /// Remove a value and report it to the eviction listener
    ///
    /// Returns true if the key was cached.
    pub fn remove(&self, key: &K) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state.detach(key);
            if removed.is_some() {
                state.stats.evictions += 1;
            }
            state.sync_stats();
            removed
        };
        match removed {
            Some(entry) => {
                self.notify(vec![(key.clone(), entry.value)]);
                true
            }
            None => false,
        }
    }

    /// Remove a value and hand it to the caller without notifying the listener
    ///
    /// Used when ownership of a cached value moves somewhere else rather than
    /// being discarded.
    pub fn take(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let taken = state.detach(key).map(|entry| entry.value);
        state.sync_stats();
        taken
    }

    /// Evict least recently used entries until the cache weighs at most `size` bytes
    pub fn trim_to_size(&self, size: usize) {
        let mut evicted = Vec::new();
        self.state.lock().unwrap().trim_to_size(size, &mut evicted);
        self.notify(evicted);
    }

    /// Evict everything
    pub fn clear_memory(&self) {
        self.trim_to_size(0);
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.state.lock().unwrap().stats
    }

    fn notify(&self, evicted: Vec<(K, V)>) {
        if evicted.is_empty() {
            return;
        }
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            for (key, value) in evicted {
                listener(&key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug, Clone)]
    struct Item {
        id: u32,
        size: usize,
        identity: Arc<()>,
    }

    impl Item {
        fn new(id: u32, size: usize) -> Self {
            Self {
                id,
                size,
                identity: Arc::new(()),
            }
        }
    }

    impl PartialEq for Item {
        fn eq(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.identity, &other.identity)
        }
    }

    impl Weighted for Item {
        fn weight(&self) -> usize {
            self.size
        }
    }

    fn recording_cache(max_size: usize) -> (LruCache<u32, Item>, Arc<Mutex<Vec<u32>>>) {
        let cache = LruCache::new(max_size);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        cache.set_eviction_listener(Arc::new(move |key: &u32, _item: Item| {
            sink.lock().unwrap().push(*key);
        }));
        (cache, evicted)
    }

    #[test]
    fn test_basic_put_get() {
        let cache = LruCache::new(100);
        let item = Item::new(1, 10);
        assert!(cache.put(1, item.clone()).is_none());

        let found = cache.get(&1).expect("Item should be in cache");
        assert_eq!(found, item);
        assert_eq!(cache.current_size(), 10);
    }

    #[test]
    fn test_cache_miss() {
        let cache: LruCache<u32, Item> = LruCache::new(100);
        assert!(cache.get(&999).is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let (cache, evicted) = recording_cache(30);
        cache.put(1, Item::new(1, 10));
        cache.put(2, Item::new(2, 10));
        cache.put(3, Item::new(3, 10));
        cache.put(4, Item::new(4, 10));

        assert_eq!(*evicted.lock().unwrap(), vec![1]);
        assert!(!cache.contains(&1));
        assert_eq!(cache.current_size(), 30);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let (cache, evicted) = recording_cache(30);
        cache.put(1, Item::new(1, 10));
        cache.put(2, Item::new(2, 10));
        cache.put(3, Item::new(3, 10));

        assert!(cache.get(&1).is_some());
        cache.put(4, Item::new(4, 10));

        assert_eq!(*evicted.lock().unwrap(), vec![2]);
        assert!(cache.contains(&1));
    }

    #[test]
    fn test_oversized_put_is_rejected_and_reported() {
        let (cache, evicted) = recording_cache(50);
        cache.put(1, Item::new(1, 10));

        assert!(cache.put(2, Item::new(2, 50)).is_none());

        assert!(!cache.contains(&2));
        assert!(cache.contains(&1));
        assert_eq!(*evicted.lock().unwrap(), vec![2]);
        assert_eq!(cache.current_size(), 10);
    }

    #[test]
    fn test_replacing_with_different_value_reports_old() {
        let (cache, evicted) = recording_cache(100);
        let first = Item::new(1, 10);
        cache.put(1, first.clone());

        let previous = cache.put(1, Item::new(1, 20));

        assert_eq!(previous, Some(first));
        assert_eq!(*evicted.lock().unwrap(), vec![1]);
        assert_eq!(cache.current_size(), 20);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_replacing_with_same_value_is_silent() {
        let (cache, evicted) = recording_cache(100);
        let item = Item::new(1, 10);
        cache.put(1, item.clone());
        cache.put(1, item.clone());

        assert!(evicted.lock().unwrap().is_empty());
        assert_eq!(cache.current_size(), 10);
    }

    #[test]
    fn test_remove_reports_once() {
        let (cache, evicted) = recording_cache(100);
        cache.put(1, Item::new(1, 10));

        assert!(cache.remove(&1));
        assert!(!cache.remove(&1));

        assert_eq!(*evicted.lock().unwrap(), vec![1]);
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn test_take_is_silent() {
        let (cache, evicted) = recording_cache(100);
        cache.put(7, Item::new(7, 10));

        let taken = cache.take(&7).expect("Item should be taken");
        assert_eq!(taken.id, 7);
        assert!(evicted.lock().unwrap().is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_trim_to_size_evicts_oldest_first() {
        let (cache, evicted) = recording_cache(100);
        for id in 1..=5 {
            cache.put(id, Item::new(id, 10));
        }

        cache.trim_to_size(25);

        assert_eq!(*evicted.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(cache.current_size(), 20);
    }

    #[test]
    fn test_clear_memory() {
        let (cache, evicted) = recording_cache(100);
        cache.put(1, Item::new(1, 10));
        cache.put(2, Item::new(2, 10));

        cache.clear_memory();

        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        assert_eq!(evicted.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_size_multiplier() {
        let (cache, evicted) = recording_cache(100);
        for id in 1..=8 {
            cache.put(id, Item::new(id, 10));
        }

        cache.set_size_multiplier(0.5);
        assert_eq!(cache.max_size(), 50);
        assert_eq!(cache.current_size(), 50);
        assert_eq!(*evicted.lock().unwrap(), vec![1, 2, 3]);

        cache.set_size_multiplier(1.5);
        assert_eq!(cache.max_size(), 150);
    }

    #[test]
    #[should_panic(expected = "Size multiplier must be >= 0")]
    fn test_negative_multiplier_panics() {
        let cache: LruCache<u32, Item> = LruCache::new(100);
        cache.set_size_multiplier(-1.0);
    }

    #[test]
    fn test_stats() {
        let cache = LruCache::new(100);
        cache.put(1, Item::new(1, 25));

        cache.get(&1);
        cache.get(&2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.bytes_used, 25);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.utilization(), 0.25);
    }

    #[test]
    fn test_budget_holds_for_random_workload() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let (cache, _evicted) = recording_cache(1_000);
        for _ in 0..2_000 {
            let key = rng.gen_range(0..200u32);
            if rng.gen_bool(0.7) {
                cache.put(key, Item::new(key, rng.gen_range(1..1_200)));
            } else {
                cache.get(&key);
            }
            assert!(cache.current_size() <= cache.max_size());
        }
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(LruCache::new(10_000));
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        cache.set_eviction_listener(Arc::new(move |_key: &u32, _item: Item| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = t * 1_000 + i;
                        cache.put(key, Item::new(key, 100));
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.current_size() <= 10_000);
        assert_eq!(cache.len() + evictions.load(Ordering::SeqCst), 2_000);
    }
}
