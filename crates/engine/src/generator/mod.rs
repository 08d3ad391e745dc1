//! Data generators
//!
//! The decode job obtains data through three generators, tried in order:
//! transformed resources from the resource disk cache, raw data from the data
//! disk cache, and finally the original source. Each generator walks its own
//! candidates; `try_start` returns true once a fetch has been started and
//! false when the generator has nothing left to try.
//!
//! Only the load that was started last may report back. Every generator of a
//! job shares one [`CurrentLoad`] slot, compared by identity, so callbacks of
//! superseded fetches are dropped and `cancel` always reaches the live fetch.

mod data_cache;
mod resource_cache;
mod source;

use std::sync::{Arc, Mutex};

use pixelflow_cache::{DataSource, DiskKey, ObjectKey};

use crate::error::FetchError;
use crate::fetcher::{Data, DataCallback, DataFetcher, LoadData, Model, ModelLoader};
use crate::helper::DecodeHelper;

pub(crate) use data_cache::DataCacheGenerator;
pub(crate) use resource_cache::ResourceCacheGenerator;
pub(crate) use source::SourceGenerator;

/// Data delivered by a generator.
pub(crate) struct FetchedData {
    /// Source key the data belongs to.
    pub source_key: ObjectKey,
    pub data: Data,
    pub fetcher: Arc<dyn DataFetcher>,
    pub origin: DataSource,
    /// The key that was actually looked up, for error reports.
    pub attempted_key: Arc<dyn DiskKey>,
}

/// Receives the results of generator fetches.
pub(crate) trait FetcherReadyCallback: Send + Sync {
    /// Run the job again on its own worker, e.g. to write fetched data to disk.
    fn reschedule(&self);

    fn on_data_fetcher_ready(&self, fetched: FetchedData);

    fn on_data_fetcher_failed(
        &self,
        attempted_key: Arc<dyn DiskKey>,
        error: FetchError,
        fetcher: Arc<dyn DataFetcher>,
        origin: DataSource,
    );
}

/// The load started last by any generator of one job.
#[derive(Clone, Default)]
pub(crate) struct CurrentLoad(Arc<Mutex<Option<Arc<LoadData>>>>);

impl CurrentLoad {
    /// Make `load_data` the only load allowed to report.
    pub(crate) fn start(&self, load_data: &Arc<LoadData>) {
        *self.0.lock().unwrap() = Some(load_data.clone());
    }

    pub(crate) fn is_current(&self, load_data: &Arc<LoadData>) -> bool {
        self.0
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, load_data))
    }

    /// Cancel the live fetch, if any. Safe from any thread.
    pub(crate) fn cancel(&self) {
        let current = self.0.lock().unwrap().clone();
        if let Some(load_data) = current {
            load_data.fetcher.cancel();
        }
    }
}

/// One stage of the fallback chain.
pub(crate) enum Generator {
    ResourceCache(ResourceCacheGenerator),
    DataCache(DataCacheGenerator),
    Source(SourceGenerator),
}

impl Generator {
    /// Start the next candidate fetch. Errors are broken invariants that end the load.
    pub(crate) fn try_start(&mut self) -> Result<bool, FetchError> {
        match self {
            Generator::ResourceCache(generator) => generator.try_start(),
            Generator::DataCache(generator) => Ok(generator.try_start()),
            Generator::Source(generator) => Ok(generator.try_start()),
        }
    }

    pub(crate) fn cancel(&self) {
        match self {
            Generator::ResourceCache(generator) => generator.cancel(),
            Generator::DataCache(generator) => generator.cancel(),
            Generator::Source(generator) => generator.cancel(),
        }
    }
}

/// Loaders for a file found in one of the disk cache tiers, tried in turn.
struct CacheFileLoaders {
    model: Model,
    loaders: Vec<Arc<dyn ModelLoader>>,
    next: usize,
}

impl CacheFileLoaders {
    fn new(helper: &DecodeHelper, file: &std::path::Path) -> Self {
        let (model, loaders) = helper.model_loaders_for_file(file);
        Self {
            model,
            loaders,
            next: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.next < self.loaders.len()
    }

    /// Start the next loader whose data can be decoded into the requested type.
    fn start_next(
        &mut self,
        helper: &DecodeHelper,
        current: &CurrentLoad,
        callback_for: impl Fn(&Arc<LoadData>) -> DataCallback,
    ) -> bool {
        while self.has_next() {
            let loader = self.loaders[self.next].clone();
            self.next += 1;

            let Some(load_data) = loader.build_load_data(
                &self.model,
                helper.width(),
                helper.height(),
                helper.options(),
            ) else {
                continue;
            };
            if !helper.has_load_path(load_data.fetcher.data_type()) {
                continue;
            }

            let load_data = Arc::new(load_data);
            current.start(&load_data);
            load_data
                .fetcher
                .load_data(helper.priority(), callback_for(&load_data));
            return true;
        }
        false
    }
}

/// Callback for a fetch of a cached file, reporting `origin` for the cache tier.
fn cache_file_callback(
    cb: Arc<dyn FetcherReadyCallback>,
    current: CurrentLoad,
    load_data: Arc<LoadData>,
    source_key: ObjectKey,
    attempted_key: Arc<dyn DiskKey>,
    origin: DataSource,
) -> DataCallback {
    Box::new(move |result| {
        if !current.is_current(&load_data) {
            return;
        }
        let fetcher = load_data.fetcher.clone();
        match result {
            Ok(data) => cb.on_data_fetcher_ready(FetchedData {
                source_key,
                data,
                fetcher,
                origin,
                attempted_key,
            }),
            Err(e) => cb.on_data_fetcher_failed(attempted_key, e, fetcher, origin),
        }
    })
}
