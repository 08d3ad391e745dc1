//! Load requests

use pixelflow_cache::{DiskCacheStrategy, ObjectKey};
use pixelflow_scheduler::Priority;

use crate::fetcher::Model;
use crate::key::{EngineKey, Options, ResourceType};
use crate::registry::Transformations;

/// Everything the engine needs to know about one load.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model: Model,
    /// Version of the model; a new signature invalidates every cached copy.
    pub signature: ObjectKey,
    pub width: u32,
    pub height: u32,
    pub resource_type: ResourceType,
    pub transformations: Transformations,
    pub options: Options,
    pub disk_cache_strategy: DiskCacheStrategy,
    pub priority: Priority,
    pub is_memory_cacheable: bool,
    pub use_unlimited_source_pool: bool,
    pub use_animation_pool: bool,
    /// Never go to the original source; fail if nothing is cached.
    pub only_retrieve_from_cache: bool,
}

impl LoadRequest {
    pub fn new(model: Model, resource_type: ResourceType, width: u32, height: u32) -> Self {
        Self {
            model,
            signature: ObjectKey::empty(),
            width,
            height,
            resource_type,
            transformations: Transformations::new(),
            options: Options::new(),
            disk_cache_strategy: DiskCacheStrategy::default(),
            priority: Priority::default(),
            is_memory_cacheable: true,
            use_unlimited_source_pool: false,
            use_animation_pool: false,
            only_retrieve_from_cache: false,
        }
    }

    pub fn with_signature(mut self, signature: ObjectKey) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_transformations(mut self, transformations: Transformations) -> Self {
        self.transformations = transformations;
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_disk_cache_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.disk_cache_strategy = strategy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_memory_cacheable(mut self, is_memory_cacheable: bool) -> Self {
        self.is_memory_cacheable = is_memory_cacheable;
        self
    }

    pub fn with_unlimited_source_pool(mut self, use_unlimited: bool) -> Self {
        self.use_unlimited_source_pool = use_unlimited;
        self
    }

    pub fn with_animation_pool(mut self, use_animation: bool) -> Self {
        self.use_animation_pool = use_animation;
        self
    }

    pub fn with_only_retrieve_from_cache(mut self, only_cache: bool) -> Self {
        self.only_retrieve_from_cache = only_cache;
        self
    }

    /// The in-memory fingerprint of this request.
    pub fn engine_key(&self) -> EngineKey {
        EngineKey::new(
            self.model.cache_key(),
            self.signature.clone(),
            self.width,
            self.height,
            self.transformations.ids(),
            self.resource_type,
            self.options.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_key_ignores_scheduling_flags() {
        let request = LoadRequest::new(Model::Uri("u".into()), ResourceType::BYTES, 10, 10);
        let other = request
            .clone()
            .with_priority(Priority::Immediate)
            .with_disk_cache_strategy(DiskCacheStrategy::None)
            .with_unlimited_source_pool(true);
        assert_eq!(request.engine_key(), other.engine_key());
    }

    #[test]
    fn test_engine_key_depends_on_identity() {
        let request = LoadRequest::new(Model::Uri("u".into()), ResourceType::BYTES, 10, 10);
        let signed = request.clone().with_signature(ObjectKey::new("v2"));
        let optioned = request.clone().with_options(Options::new().with("dpi", "2"));
        let resized = LoadRequest::new(Model::Uri("u".into()), ResourceType::BYTES, 20, 10);

        assert_ne!(request.engine_key(), signed.engine_key());
        assert_ne!(request.engine_key(), optioned.engine_key());
        assert_ne!(request.engine_key(), resized.engine_key());
    }
}
