//! The loading engine
//!
//! [`Engine::load`] resolves a request against, in order: the memory cache,
//! the resources consumers currently hold, an in-flight job for the same key
//! and finally a new job. Only the last step does any work; every other step
//! just subscribes the caller.
//!
//! Released resources come back through [`ResourceListener`] and move into the
//! memory cache, or get recycled if the request opted out of memory caching.

use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use pixelflow_cache::{
    DataSource, DiskCache, DiskLruCache, EngineConfig, MemoryCategory, TrimLevel,
};
use pixelflow_scheduler::{EnginePools, Executor};
use tracing::{debug, info, trace};

use crate::active::{ActiveResources, ReclaimObserver};
use crate::decode_job::{DecodeCallback, DecodeJob};
use crate::error::EngineError;
use crate::helper::DecodeHelper;
use crate::job::{
    Delivery, EngineJob, EngineJobListener, JobFlags, ResourceCallback, Subscription,
};
use crate::jobs::Jobs;
use crate::key::EngineKey;
use crate::memory::{LruResourceCache, MemoryCache, ResourceRemovedListener};
use crate::recycler::ResourceRecycler;
use crate::registry::Registry;
use crate::request::LoadRequest;
use crate::resource::{EngineResource, ResourceListener};

/// Handle to a subscription returned by [`Engine::load`].
pub struct LoadStatus {
    job: Arc<EngineJob>,
    cb: Arc<dyn ResourceCallback>,
}

impl LoadStatus {
    /// Stop waiting for the load. The load itself is cancelled once no subscriber is left.
    ///
    /// Calling this more than once, or after the result was delivered, does nothing.
    pub fn cancel(&self) {
        self.job.remove_callback(&self.cb);
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    registry: Registry,
    disk_cache: Option<Arc<dyn DiskCache>>,
    memory_cache: Option<Arc<dyn MemoryCache>>,
    memory_cache_size: usize,
    memory_category: MemoryCategory,
    pools: Option<EnginePools>,
    retain_cleared_payload: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self {
            registry: Registry::new(),
            disk_cache: None,
            memory_cache: None,
            memory_cache_size: config.memory_cache_size,
            memory_category: config.memory_category,
            pools: None,
            retain_cleared_payload: config.retain_cleared_payload,
        }
    }
}

impl EngineBuilder {
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn disk_cache(mut self, disk_cache: Arc<dyn DiskCache>) -> Self {
        self.disk_cache = Some(disk_cache);
        self
    }

    /// Use a custom memory cache. Overrides [`EngineBuilder::memory_cache_size`].
    pub fn memory_cache(mut self, memory_cache: Arc<dyn MemoryCache>) -> Self {
        self.memory_cache = Some(memory_cache);
        self
    }

    /// Budget of the default memory cache in bytes.
    pub fn memory_cache_size(mut self, bytes: usize) -> Self {
        self.memory_cache_size = bytes;
        self
    }

    pub fn memory_category(mut self, category: MemoryCategory) -> Self {
        self.memory_category = category;
        self
    }

    pub fn pools(mut self, pools: EnginePools) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Keep the payload of resources dropped without a release so it can
    /// still reach the memory cache.
    pub fn retain_cleared_payload(mut self, retain: bool) -> Self {
        self.retain_cleared_payload = retain;
        self
    }

    /// Build the engine. Without an explicit disk cache one is opened in the
    /// default cache directory with the default budget.
    pub fn build(self) -> Result<Engine, EngineError> {
        let disk_cache = match self.disk_cache {
            Some(disk_cache) => disk_cache,
            None => {
                let config = EngineConfig::default();
                open_disk_cache(&config.disk_cache_dir, config.disk_cache_size)?
            }
        };
        let memory_cache: Arc<dyn MemoryCache> = match self.memory_cache {
            Some(memory_cache) => memory_cache,
            None => Arc::new(LruResourceCache::new(self.memory_cache_size)),
        };
        memory_cache.set_size_multiplier(self.memory_category.multiplier());
        let pools = Arc::new(self.pools.unwrap_or_else(|| EnginePools::new(None, None)));

        let core = Arc::new_cyclic(|me: &Weak<EngineCore>| {
            let resource_listener: Weak<dyn ResourceListener> = me.clone();
            let removed_listener: Weak<dyn ResourceRemovedListener> = me.clone();

            let active = ActiveResources::new(self.retain_cleared_payload);
            active.set_listener(resource_listener);
            memory_cache.set_resource_removed_listener(removed_listener);

            EngineCore {
                registry: Arc::new(self.registry),
                disk_cache,
                memory_cache,
                active,
                jobs: Jobs::default(),
                recycler: ResourceRecycler::new(pools.main().clone()),
                pools,
                lookup_lock: Mutex::new(()),
                evicted: Mutex::new(Vec::new()),
                me: me.clone(),
            }
        });

        debug!(
            memory_cache_max = core.memory_cache.max_size(),
            retain_cleared_payload = self.retain_cleared_payload,
            "Engine created"
        );
        Ok(Engine { core })
    }
}

fn open_disk_cache(dir: &Path, size: usize) -> Result<Arc<dyn DiskCache>, EngineError> {
    let disk_cache = DiskLruCache::open(dir, size)?;
    info!(dir = %dir.display(), size, "Opened disk cache");
    Ok(Arc::new(disk_cache))
}

/// Request-deduplicating resource loader.
///
/// Cheap to clone; clones share caches, jobs and pools.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Build an engine from `config` with thread-backed pools.
    pub fn from_config(config: &EngineConfig, registry: Registry) -> Result<Self, EngineError> {
        let disk_cache = open_disk_cache(&config.disk_cache_dir, config.disk_cache_size)?;
        Self::builder()
            .registry(registry)
            .disk_cache(disk_cache)
            .memory_cache_size(config.memory_cache_size)
            .memory_category(config.memory_category)
            .retain_cleared_payload(config.retain_cleared_payload)
            .pools(EnginePools::new(
                config.source_threads,
                config.animation_threads,
            ))
            .build()
    }

    /// Build an engine from the default configuration overridden by the environment.
    pub fn from_env(registry: Registry) -> Result<Self, EngineError> {
        let config = EngineConfig::from_env()?;
        Self::from_config(&config, registry)
    }

    /// Start or join a load for `request`.
    ///
    /// `cb` is called on `executor` exactly once unless the load is cancelled
    /// first. Returns `None` if the resource was served from memory, in which
    /// case there is nothing to cancel.
    pub fn load(
        &self,
        request: LoadRequest,
        cb: Arc<dyn ResourceCallback>,
        executor: Arc<dyn Executor>,
    ) -> Option<LoadStatus> {
        let core = &self.core;
        let key = request.engine_key();

        // Delivery and job start run without the lookup lock; callbacks may re-enter.
        let lookup = core.with_lookup_lock(|| core.lookup(&key, &request, &cb, &executor));
        match lookup {
            Lookup::Memory(resource) => {
                debug!(key = %key, "Loaded resource from memory");
                executor.execute(Box::new(move || {
                    let _guard = cb.lock().lock().unwrap();
                    cb.on_resource_ready(resource, DataSource::MemoryCache, false);
                }));
                None
            }
            Lookup::Joined(job, delivery) => {
                debug!(key = %key, "Added to existing load");
                if let Some(delivery) = delivery {
                    delivery.dispatch();
                }
                Some(LoadStatus { job, cb })
            }
            Lookup::Started(job) => {
                let decode_callback = Arc::downgrade(&job);
                let decode_callback: Weak<dyn DecodeCallback> = decode_callback;
                let helper = DecodeHelper::new(
                    core.registry.clone(),
                    core.disk_cache.clone(),
                    request,
                );
                job.start(DecodeJob::new(Arc::new(helper), key.clone(), decode_callback));
                debug!(key = %key, "Started new load");
                Some(LoadStatus { job, cb })
            }
        }
    }

    /// Give back a resource handed to a [`ResourceCallback`].
    pub fn release(&self, resource: &EngineResource) {
        resource.release();
    }

    pub fn clear_memory(&self) {
        debug!("Clearing memory cache");
        self.core.memory_cache.clear_memory();
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        self.core.memory_cache.trim_memory(level);
    }

    pub fn set_memory_category(&self, category: MemoryCategory) {
        debug!(?category, "Setting memory category");
        self.core
            .memory_cache
            .set_size_multiplier(category.multiplier());
    }

    /// Remove every disk cache entry. Must not race with running loads.
    pub fn clear_disk_cache(&self) {
        debug!("Clearing disk cache");
        self.core.disk_cache.clear();
    }

    /// Called on the watcher thread after a dropped resource was reclaimed.
    pub fn set_reclaim_observer(&self, observer: ReclaimObserver) {
        self.core.active.set_reclaim_observer(observer);
    }

    /// The delivery context of the engine's pools.
    pub fn main_executor(&self) -> Arc<dyn Executor> {
        self.core.pools.main().clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    pub fn memory_cache_size(&self) -> usize {
        self.core.memory_cache.current_size()
    }

    pub fn memory_cache_max_size(&self) -> usize {
        self.core.memory_cache.max_size()
    }

    /// Number of resources currently tracked as held by consumers.
    pub fn active_count(&self) -> usize {
        self.core.active.len()
    }

    /// Number of in-flight jobs.
    pub fn job_count(&self) -> usize {
        self.core.jobs.len()
    }

    /// Stop the reclamation watcher and every pool.
    pub fn shutdown(&self) {
        info!("Shutting down engine");
        self.core.active.shutdown();
        self.core.pools.shutdown();
    }
}

/// Where [`EngineCore::lookup`] found the request.
enum Lookup {
    Memory(EngineResource),
    Joined(Arc<EngineJob>, Option<Delivery>),
    Started(Arc<EngineJob>),
}

struct EngineCore {
    registry: Arc<Registry>,
    disk_cache: Arc<dyn DiskCache>,
    memory_cache: Arc<dyn MemoryCache>,
    active: ActiveResources,
    jobs: Jobs,
    pools: Arc<EnginePools>,
    recycler: ResourceRecycler,
    /// Serializes lookups, job table changes and release handling, so a key
    /// has at most one job and a resource is never both handed out and
    /// moved to the memory cache.
    lookup_lock: Mutex<()>,
    /// Evicted from the memory cache, recycled once the lookup lock is free.
    evicted: Mutex<Vec<EngineResource>>,
    me: Weak<EngineCore>,
}

impl EngineCore {
    /// Run `f` under the lookup lock, then recycle whatever it evicted.
    fn with_lookup_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let _guard = self.lookup_lock.lock().unwrap();
            f()
        };
        self.recycle_evicted();
        result
    }

    fn recycle_evicted(&self) {
        let evicted = std::mem::take(&mut *self.evicted.lock().unwrap());
        for resource in evicted {
            self.recycler.recycle(resource, true);
        }
    }

    /// Resolve `key` to a memory hit, an existing job or a new one. Caller holds the lookup lock.
    fn lookup(
        &self,
        key: &EngineKey,
        request: &LoadRequest,
        cb: &Arc<dyn ResourceCallback>,
        executor: &Arc<dyn Executor>,
    ) -> Lookup {
        if let Some(resource) = self.load_from_memory(key, request.is_memory_cacheable) {
            return Lookup::Memory(resource);
        }

        if let Some(job) = self.jobs.get(key, request.only_retrieve_from_cache) {
            match job.subscribe(cb.clone(), executor.clone()) {
                Subscription::Pending => return Lookup::Joined(job, None),
                Subscription::Finished(delivery) => return Lookup::Joined(job, Some(delivery)),
                Subscription::Closed => {
                    // Cancelled or finished, a fresh job takes its place.
                    self.jobs.remove_if_current(&job);
                }
            }
        }

        let job = self.new_job(key, request);
        // A new job is always open.
        let _ = job.subscribe(cb.clone(), executor.clone());
        self.jobs.insert(job.clone());
        Lookup::Started(job)
    }

    /// Acquire a resource for `key` from the memory cache or the active registry.
    fn load_from_memory(&self, key: &EngineKey, is_memory_cacheable: bool) -> Option<EngineResource> {
        if !is_memory_cacheable {
            return None;
        }

        if let Some(resource) = self.memory_cache.take(key) {
            trace!(key = %key, "Memory cache hit");
            resource.acquire();
            self.active.activate(key.clone(), &resource);
            return Some(resource);
        }
        if let Some(resource) = self.active.get(key) {
            trace!(key = %key, "Active resource hit");
            resource.acquire();
            return Some(resource);
        }
        None
    }

    fn new_job(&self, key: &EngineKey, request: &LoadRequest) -> Arc<EngineJob> {
        let listener: Weak<dyn EngineJobListener> = self.me.clone();
        let resource_listener: Weak<dyn ResourceListener> = self.me.clone();
        EngineJob::new(
            key.clone(),
            JobFlags {
                is_memory_cacheable: request.is_memory_cacheable,
                use_unlimited_source_pool: request.use_unlimited_source_pool,
                use_animation_pool: request.use_animation_pool,
                only_retrieve_from_cache: request.only_retrieve_from_cache,
            },
            self.pools.clone(),
            listener,
            resource_listener,
        )
    }
}

impl EngineJobListener for EngineCore {
    fn on_engine_job_complete(
        &self,
        job: &Arc<EngineJob>,
        key: &EngineKey,
        resource: Option<&EngineResource>,
    ) {
        // Activation and removal are one step for `lookup`.
        self.with_lookup_lock(|| {
            if let Some(resource) = resource.filter(|resource| resource.is_memory_cacheable()) {
                self.active.activate(key.clone(), resource);
            }
            self.jobs.remove_if_current(job);
        });
    }

    fn on_engine_job_cancelled(&self, job: &Arc<EngineJob>, _key: &EngineKey) {
        self.with_lookup_lock(|| {
            self.jobs.remove_if_current(job);
        });
    }
}

impl ResourceListener for EngineCore {
    fn on_resource_released(&self, key: &EngineKey, resource: EngineResource) {
        let to_recycle = self.with_lookup_lock(|| {
            if !resource.settle_release() {
                // Handed out again, or already moved on by an earlier notification.
                return None;
            }
            if self.active.is_tracking(key, &resource) {
                self.active.deactivate(key);
            }
            if resource.is_memory_cacheable() {
                trace!(key = %key, "Moving released resource to memory cache");
                self.memory_cache.put(key.clone(), resource);
                None
            } else {
                Some(resource)
            }
        });

        // Recycling may release other resources, which takes the lookup lock again.
        if let Some(resource) = to_recycle {
            self.recycler.recycle(resource, false);
        }
    }
}

impl ResourceRemovedListener for EngineCore {
    fn on_resource_removed(&self, resource: EngineResource) {
        self.evicted.lock().unwrap().push(resource);
        // A holder of the lookup lock recycles on its way out.
        if let Ok(guard) = self.lookup_lock.try_lock() {
            drop(guard);
            self.recycle_evicted();
        }
    }
}
