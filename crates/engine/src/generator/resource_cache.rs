//! Generator over the resource disk cache.

use std::sync::Arc;

use pixelflow_cache::{DataSource, DiskKey, ObjectKey};
use tracing::trace;

use super::{cache_file_callback, CacheFileLoaders, CurrentLoad, FetcherReadyCallback};
use crate::error::FetchError;
use crate::helper::DecodeHelper;
use crate::key::ResourceType;

/// Looks for transformed resources of every source key and registered type.
pub(crate) struct ResourceCacheGenerator {
    helper: Arc<DecodeHelper>,
    cb: Arc<dyn FetcherReadyCallback>,
    current: CurrentLoad,
    /// Next (source key, resource type) pair, flattened.
    next_pair: usize,
    loaders: Option<CacheFileLoaders>,
    source_key: Option<ObjectKey>,
    attempted_key: Option<Arc<dyn DiskKey>>,
}

impl ResourceCacheGenerator {
    pub(crate) fn new(
        helper: Arc<DecodeHelper>,
        cb: Arc<dyn FetcherReadyCallback>,
        current: CurrentLoad,
    ) -> Self {
        Self {
            helper,
            cb,
            current,
            next_pair: 0,
            loaders: None,
            source_key: None,
            attempted_key: None,
        }
    }

    pub(crate) fn try_start(&mut self) -> Result<bool, FetchError> {
        let source_keys = self.helper.cache_keys().to_vec();
        if source_keys.is_empty() {
            return Ok(false);
        }

        let resource_types = self.helper.registered_resource_types();
        if resource_types.is_empty() {
            if self.helper.resource_type() == ResourceType::FILE {
                return Ok(false);
            }
            return Err(FetchError::NoLoadPath {
                from: format!("{:?}", self.helper.model()),
                to: self.helper.resource_type().to_string(),
            });
        }

        loop {
            if let (Some(loaders), Some(source_key), Some(attempted_key)) =
                (&mut self.loaders, &self.source_key, &self.attempted_key)
            {
                let cb = self.cb.clone();
                let current = self.current.clone();
                let started = loaders.start_next(&self.helper, &self.current, |load_data| {
                    cache_file_callback(
                        cb.clone(),
                        current.clone(),
                        load_data.clone(),
                        source_key.clone(),
                        attempted_key.clone(),
                        DataSource::ResourceDiskCache,
                    )
                });
                if started {
                    return Ok(true);
                }
            }

            if self.next_pair >= source_keys.len() * resource_types.len() {
                return Ok(false);
            }
            let source_key = &source_keys[self.next_pair / resource_types.len()];
            let resource_type = resource_types[self.next_pair % resource_types.len()];
            self.next_pair += 1;

            let key = self.helper.resource_cache_key(source_key, resource_type);
            self.loaders = None;
            if let Some(file) = self.helper.disk_cache().get(&key) {
                trace!(key = ?key, "Resource cache hit");
                self.loaders = Some(CacheFileLoaders::new(&self.helper, &file));
                self.source_key = Some(source_key.clone());
                self.attempted_key = Some(Arc::new(key));
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.current.cancel();
    }
}
