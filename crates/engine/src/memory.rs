//! Resource memory cache
//!
//! Adapts the generic byte-budgeted [`LruCache`] to engine resources and
//! reports every removal to a [`ResourceRemovedListener`], which decides
//! whether the payload can be recycled.

use std::sync::{Arc, Mutex, Weak};

use pixelflow_cache::{CacheStats, LruCache, TrimAction, TrimLevel};
use tracing::debug;

use crate::key::EngineKey;
use crate::resource::EngineResource;

/// Notified once per resource evicted from the memory cache.
pub trait ResourceRemovedListener: Send + Sync {
    fn on_resource_removed(&self, resource: EngineResource);
}

/// Memory cache contract used by the engine.
pub trait MemoryCache: Send + Sync {
    fn max_size(&self) -> usize;

    fn current_size(&self) -> usize;

    /// Scale the configured budget, trimming if it shrinks.
    fn set_size_multiplier(&self, multiplier: f32);

    /// Remove and return the resource for `key` without notifying the listener.
    fn take(&self, key: &EngineKey) -> Option<EngineResource>;

    /// Store `resource`, returning any different resource it replaced.
    fn put(&self, key: EngineKey, resource: EngineResource) -> Option<EngineResource>;

    fn set_resource_removed_listener(&self, listener: Weak<dyn ResourceRemovedListener>);

    fn clear_memory(&self);

    fn trim_memory(&self, level: TrimLevel);
}

/// LRU memory cache for engine resources.
pub struct LruResourceCache {
    cache: LruCache<EngineKey, EngineResource>,
    listener: Arc<Mutex<Option<Weak<dyn ResourceRemovedListener>>>>,
}

impl LruResourceCache {
    pub fn new(max_size: usize) -> Self {
        let cache = LruCache::new(max_size);
        let listener: Arc<Mutex<Option<Weak<dyn ResourceRemovedListener>>>> =
            Arc::new(Mutex::new(None));

        let eviction_listener = listener.clone();
        cache.set_eviction_listener(Arc::new(move |_key: &EngineKey, resource| {
            let listener = eviction_listener.lock().unwrap().clone();
            if let Some(listener) = listener.as_ref().and_then(Weak::upgrade) {
                listener.on_resource_removed(resource);
            }
        }));

        Self { cache, listener }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains(&self, key: &EngineKey) -> bool {
        self.cache.contains(key)
    }

    /// Evict the entry for `key`, notifying the listener.
    pub fn remove(&self, key: &EngineKey) -> bool {
        self.cache.remove(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl MemoryCache for LruResourceCache {
    fn max_size(&self) -> usize {
        self.cache.max_size()
    }

    fn current_size(&self) -> usize {
        self.cache.current_size()
    }

    fn set_size_multiplier(&self, multiplier: f32) {
        self.cache.set_size_multiplier(multiplier);
    }

    fn take(&self, key: &EngineKey) -> Option<EngineResource> {
        self.cache.take(key)
    }

    fn put(&self, key: EngineKey, resource: EngineResource) -> Option<EngineResource> {
        self.cache.put(key, resource)
    }

    fn set_resource_removed_listener(&self, listener: Weak<dyn ResourceRemovedListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn clear_memory(&self) {
        self.cache.clear_memory();
    }

    fn trim_memory(&self, level: TrimLevel) {
        let action = level.action();
        debug!(?level, ?action, "Trimming memory cache");
        match action {
            TrimAction::Clear => self.cache.clear_memory(),
            TrimAction::Halve => self.cache.trim_to_size(self.cache.max_size() / 2),
            TrimAction::Keep => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::{test_key, CountingResource};

    #[derive(Default)]
    struct Removed {
        ids: Mutex<Vec<u64>>,
    }

    impl ResourceRemovedListener for Removed {
        fn on_resource_removed(&self, resource: EngineResource) {
            self.ids.lock().unwrap().push(resource.id());
        }
    }

    fn cache_with_listener(max_size: usize) -> (LruResourceCache, Arc<Removed>) {
        let cache = LruResourceCache::new(max_size);
        let removed = Arc::new(Removed::default());
        let weak: Weak<dyn ResourceRemovedListener> =
            Arc::downgrade(&(removed.clone() as Arc<dyn ResourceRemovedListener>));
        cache.set_resource_removed_listener(weak);
        (cache, removed)
    }

    fn resource(model: &str, size: usize) -> EngineResource {
        EngineResource::new(CountingResource::with_size(size), true, true, test_key(model), None)
    }

    #[test]
    fn test_take_does_not_notify() {
        let (cache, removed) = cache_with_listener(100);
        let a = resource("a", 10);
        cache.put(test_key("a"), a.clone());

        assert_eq!(cache.take(&test_key("a")), Some(a));
        assert!(cache.is_empty());
        assert!(removed.ids.lock().unwrap().is_empty());
    }

    #[test]
    fn test_eviction_notifies_listener() {
        let (cache, removed) = cache_with_listener(25);
        let a = resource("a", 10);
        let b = resource("b", 10);
        let c = resource("c", 10);
        cache.put(test_key("a"), a.clone());
        cache.put(test_key("b"), b);
        cache.put(test_key("c"), c);

        assert_eq!(*removed.ids.lock().unwrap(), vec![a.id()]);
        assert!(cache.current_size() <= cache.max_size());
    }

    #[test]
    fn test_remove_notifies_listener() {
        let (cache, removed) = cache_with_listener(100);
        let a = resource("a", 10);
        cache.put(test_key("a"), a.clone());

        assert!(cache.remove(&test_key("a")));
        assert_eq!(*removed.ids.lock().unwrap(), vec![a.id()]);
    }

    #[test]
    fn test_oversized_put_reported_as_removed() {
        let (cache, removed) = cache_with_listener(10);
        let big = resource("big", 10);
        cache.put(test_key("big"), big.clone());

        assert!(!cache.contains(&test_key("big")));
        assert_eq!(*removed.ids.lock().unwrap(), vec![big.id()]);
    }

    #[test]
    fn test_trim_memory_levels() {
        let (cache, removed) = cache_with_listener(100);
        for (i, model) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.put(test_key(model), resource(model, 20 + i));
        }
        let before = cache.current_size();

        cache.trim_memory(TrimLevel::RunningModerate);
        assert_eq!(cache.current_size(), before);

        cache.trim_memory(TrimLevel::UiHidden);
        assert!(cache.current_size() <= 50);
        assert!(!removed.ids.lock().unwrap().is_empty());

        cache.trim_memory(TrimLevel::Complete);
        assert!(cache.is_empty());
        assert_eq!(removed.ids.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_size_multiplier_trims() {
        let (cache, removed) = cache_with_listener(100);
        cache.put(test_key("a"), resource("a", 40));
        cache.put(test_key("b"), resource("b", 40));

        cache.set_size_multiplier(0.5);
        assert_eq!(cache.max_size(), 50);
        assert!(cache.current_size() <= 50);
        assert_eq!(removed.ids.lock().unwrap().len(), 1);
    }
}
