//! Generator over the data disk cache.

use std::sync::Arc;

use pixelflow_cache::{DataSource, DiskKey, ObjectKey};
use tracing::trace;

use super::{cache_file_callback, CacheFileLoaders, CurrentLoad, FetcherReadyCallback};
use crate::helper::DecodeHelper;

/// Looks for unmodified source data under each of the given keys.
pub(crate) struct DataCacheGenerator {
    helper: Arc<DecodeHelper>,
    cb: Arc<dyn FetcherReadyCallback>,
    current: CurrentLoad,
    source_keys: Vec<ObjectKey>,
    next_key: usize,
    loaders: Option<CacheFileLoaders>,
    source_key: Option<ObjectKey>,
}

impl DataCacheGenerator {
    /// Search every cache key of the model.
    pub(crate) fn new(
        helper: Arc<DecodeHelper>,
        cb: Arc<dyn FetcherReadyCallback>,
        current: CurrentLoad,
    ) -> Self {
        let keys = helper.cache_keys().to_vec();
        Self::with_keys(keys, helper, cb, current)
    }

    /// Search only `source_keys`, e.g. the key data was just written under.
    pub(crate) fn with_keys(
        source_keys: Vec<ObjectKey>,
        helper: Arc<DecodeHelper>,
        cb: Arc<dyn FetcherReadyCallback>,
        current: CurrentLoad,
    ) -> Self {
        Self {
            helper,
            cb,
            current,
            source_keys,
            next_key: 0,
            loaders: None,
            source_key: None,
        }
    }

    pub(crate) fn try_start(&mut self) -> bool {
        loop {
            if let (Some(loaders), Some(source_key)) = (&mut self.loaders, &self.source_key) {
                let cb = self.cb.clone();
                let current = self.current.clone();
                let attempted_key: Arc<dyn DiskKey> = Arc::new(source_key.clone());
                let started = loaders.start_next(&self.helper, &self.current, |load_data| {
                    cache_file_callback(
                        cb.clone(),
                        current.clone(),
                        load_data.clone(),
                        source_key.clone(),
                        attempted_key.clone(),
                        DataSource::DataDiskCache,
                    )
                });
                if started {
                    return true;
                }
            }

            let Some(source_key) = self.source_keys.get(self.next_key).cloned() else {
                return false;
            };
            self.next_key += 1;

            let key = self.helper.data_cache_key(&source_key);
            self.loaders = None;
            if let Some(file) = self.helper.disk_cache().get(&key) {
                trace!(key = ?key, "Data cache hit");
                self.loaders = Some(CacheFileLoaders::new(&self.helper, &file));
                self.source_key = Some(source_key);
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.current.cancel();
    }
}
