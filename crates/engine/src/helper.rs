//! Per-load lookups shared by the generators and the decode job.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use pixelflow_cache::{DiskCache, DiskCacheStrategy, ObjectKey};
use pixelflow_scheduler::Priority;

use crate::fetcher::{DataType, LoadData, Model, ModelLoader};
use crate::key::{DataCacheKey, Options, ResourceCacheKey, ResourceType};
use crate::registry::{LoadPath, Registry, ResourceEncoder, SourceEncoder, Transformation};
use crate::request::LoadRequest;

/// Request parameters plus lazily computed load candidates.
pub(crate) struct DecodeHelper {
    registry: Arc<Registry>,
    disk_cache: Arc<dyn DiskCache>,
    request: LoadRequest,
    load_data: OnceLock<Vec<Arc<LoadData>>>,
    cache_keys: OnceLock<Vec<ObjectKey>>,
}

impl DecodeHelper {
    pub(crate) fn new(
        registry: Arc<Registry>,
        disk_cache: Arc<dyn DiskCache>,
        request: LoadRequest,
    ) -> Self {
        Self {
            registry,
            disk_cache,
            request,
            load_data: OnceLock::new(),
            cache_keys: OnceLock::new(),
        }
    }

    pub(crate) fn disk_cache(&self) -> &dyn DiskCache {
        self.disk_cache.as_ref()
    }

    pub(crate) fn strategy(&self) -> DiskCacheStrategy {
        self.request.disk_cache_strategy
    }

    pub(crate) fn priority(&self) -> Priority {
        self.request.priority
    }

    pub(crate) fn width(&self) -> u32 {
        self.request.width
    }

    pub(crate) fn height(&self) -> u32 {
        self.request.height
    }

    pub(crate) fn options(&self) -> &Options {
        &self.request.options
    }

    pub(crate) fn resource_type(&self) -> ResourceType {
        self.request.resource_type
    }

    pub(crate) fn model(&self) -> &Model {
        &self.request.model
    }

    pub(crate) fn only_retrieve_from_cache(&self) -> bool {
        self.request.only_retrieve_from_cache
    }

    /// Load candidates for the requested model, computed once.
    pub(crate) fn load_data(&self) -> &[Arc<LoadData>] {
        self.load_data.get_or_init(|| {
            let request = &self.request;
            self.registry
                .model_loaders(&request.model)
                .iter()
                .filter_map(|loader| {
                    loader.build_load_data(
                        &request.model,
                        request.width,
                        request.height,
                        &request.options,
                    )
                })
                .map(Arc::new)
                .collect()
        })
    }

    /// Every key the model's data may be cached under, primary keys first.
    pub(crate) fn cache_keys(&self) -> &[ObjectKey] {
        self.cache_keys.get_or_init(|| {
            let mut keys: Vec<ObjectKey> = Vec::new();
            for load_data in self.load_data() {
                let candidates =
                    std::iter::once(&load_data.source_key).chain(&load_data.alternate_keys);
                for key in candidates {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
            }
            keys
        })
    }

    /// Returns true if `key` is the primary key of one of the load candidates.
    pub(crate) fn is_source_key(&self, key: &ObjectKey) -> bool {
        self.load_data()
            .iter()
            .any(|load_data| load_data.source_key == *key)
    }

    /// Loaders able to read a file found in the disk cache.
    pub(crate) fn model_loaders_for_file(
        &self,
        file: &Path,
    ) -> (Model, Vec<Arc<dyn ModelLoader>>) {
        let model = Model::File(file.to_path_buf());
        let loaders = self.registry.model_loaders(&model);
        (model, loaders)
    }

    pub(crate) fn has_load_path(&self, data_type: DataType) -> bool {
        self.load_path(data_type).is_some()
    }

    pub(crate) fn load_path(&self, data_type: DataType) -> Option<LoadPath> {
        self.registry.load_path(data_type, self.request.resource_type)
    }

    pub(crate) fn registered_resource_types(&self) -> Vec<ResourceType> {
        self.registry
            .registered_resource_types(self.request.resource_type)
    }

    pub(crate) fn transformation(
        &self,
        resource_type: ResourceType,
    ) -> Option<Arc<dyn Transformation>> {
        self.request.transformations.get(resource_type).cloned()
    }

    fn transformation_id(&self, resource_type: ResourceType) -> String {
        self.transformation(resource_type)
            .map(|transformation| transformation.id().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn data_cache_key(&self, source_key: &ObjectKey) -> DataCacheKey {
        DataCacheKey::new(source_key.clone(), self.request.signature.clone())
    }

    pub(crate) fn resource_cache_key(
        &self,
        source_key: &ObjectKey,
        resource_type: ResourceType,
    ) -> ResourceCacheKey {
        ResourceCacheKey::new(
            source_key.clone(),
            self.request.signature.clone(),
            self.request.width,
            self.request.height,
            self.transformation_id(resource_type),
            resource_type,
            self.request.options.clone(),
        )
    }

    pub(crate) fn result_encoder(&self) -> Option<Arc<dyn ResourceEncoder>> {
        self.registry.result_encoder(self.request.resource_type)
    }

    pub(crate) fn source_encoder(&self, data_type: DataType) -> Option<Arc<dyn SourceEncoder>> {
        self.registry.source_encoder(data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{DataCallback, DataFetcher};
    use pixelflow_cache::{DataSource, DiskKey, DiskLruCache};
    use tempfile::TempDir;

    struct NeverFetcher;

    impl DataFetcher for NeverFetcher {
        fn load_data(&self, _priority: Priority, _callback: DataCallback) {}

        fn data_type(&self) -> DataType {
            DataType::Bytes
        }

        fn data_source(&self) -> DataSource {
            DataSource::Remote
        }
    }

    struct KeyedLoader {
        source: &'static str,
        alternates: Vec<&'static str>,
    }

    impl ModelLoader for KeyedLoader {
        fn handles(&self, model: &Model) -> bool {
            matches!(model, Model::Uri(_))
        }

        fn build_load_data(
            &self,
            _model: &Model,
            _width: u32,
            _height: u32,
            _options: &Options,
        ) -> Option<LoadData> {
            let alternates = self.alternates.iter().map(|key| ObjectKey::new(*key));
            Some(
                LoadData::new(ObjectKey::new(self.source), Arc::new(NeverFetcher))
                    .with_alternate_keys(alternates.collect()),
            )
        }
    }

    fn helper(dir: &TempDir) -> DecodeHelper {
        let registry = Registry::new()
            .append_model_loader(Arc::new(KeyedLoader {
                source: "a",
                alternates: vec!["alt", "b"],
            }))
            .append_model_loader(Arc::new(KeyedLoader {
                source: "b",
                alternates: vec!["alt"],
            }));
        let disk_cache = Arc::new(DiskLruCache::open(dir.path(), 1024 * 1024).unwrap());
        DecodeHelper::new(
            Arc::new(registry),
            disk_cache,
            LoadRequest::new(Model::Uri("u".into()), ResourceType::BYTES, 8, 8),
        )
    }

    #[test]
    fn test_cache_keys_are_deduplicated_in_order() {
        let dir = TempDir::new().unwrap();
        let helper = helper(&dir);

        assert_eq!(helper.load_data().len(), 2);
        let keys: Vec<&str> = helper.cache_keys().iter().map(ObjectKey::as_str).collect();
        assert_eq!(keys, vec!["a", "alt", "b"]);
    }

    #[test]
    fn test_load_data_is_computed_once() {
        let dir = TempDir::new().unwrap();
        let helper = helper(&dir);
        let first = helper.load_data()[0].clone();
        assert!(Arc::ptr_eq(&first, &helper.load_data()[0]));
    }

    #[test]
    fn test_source_keys() {
        let dir = TempDir::new().unwrap();
        let helper = helper(&dir);
        assert!(helper.is_source_key(&ObjectKey::new("a")));
        assert!(helper.is_source_key(&ObjectKey::new("b")));
        assert!(!helper.is_source_key(&ObjectKey::new("alt")));
    }

    #[test]
    fn test_cache_file_loaders() {
        let dir = TempDir::new().unwrap();
        let helper = helper(&dir);
        let (model, loaders) = helper.model_loaders_for_file(&dir.path().join("x.bin"));
        assert!(matches!(model, Model::File(_)));
        assert_eq!(loaders.len(), 1);
        assert!(helper.has_load_path(DataType::File));
    }

    #[test]
    fn test_keys_without_transformation() {
        let dir = TempDir::new().unwrap();
        let helper = helper(&dir);
        let key = ObjectKey::new("a");
        assert_eq!(
            helper.resource_cache_key(&key, ResourceType::BYTES).safe_key(),
            ResourceCacheKey::new(
                key.clone(),
                ObjectKey::empty(),
                8,
                8,
                "",
                ResourceType::BYTES,
                Options::new()
            )
            .safe_key()
        );
        assert_ne!(
            helper.data_cache_key(&key).safe_key(),
            helper.resource_cache_key(&key, ResourceType::BYTES).safe_key()
        );
    }
}
