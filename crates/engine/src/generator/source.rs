//! Generator over the original source.
//!
//! Data from an origin the strategy wants cached takes a detour: the fetch
//! callback only parks the data and asks for a reschedule, the next run writes
//! it to the data disk cache on the job's worker, and the load continues by
//! reading the fresh entry back. If the write fails the parked data is
//! delivered as is.

use std::path::Path;
use std::sync::{Arc, Mutex};

use pixelflow_cache::{DataSource, DiskKey};
use tracing::{debug, warn};

use super::{CurrentLoad, DataCacheGenerator, FetchedData, FetcherReadyCallback};
use crate::error::FetchError;
use crate::fetcher::{Data, DataFetcher, LoadData};
use crate::helper::DecodeHelper;

#[derive(Default)]
struct SourceShared {
    /// Fetched data waiting to be written to the data disk cache.
    data_to_cache: Mutex<Option<(Arc<LoadData>, Data)>>,
}

/// Fetches each load candidate of the model in turn.
pub(crate) struct SourceGenerator {
    helper: Arc<DecodeHelper>,
    cb: Arc<dyn FetcherReadyCallback>,
    current: CurrentLoad,
    next_index: usize,
    shared: Arc<SourceShared>,
    source_cache_generator: Option<DataCacheGenerator>,
}

impl SourceGenerator {
    pub(crate) fn new(
        helper: Arc<DecodeHelper>,
        cb: Arc<dyn FetcherReadyCallback>,
        current: CurrentLoad,
    ) -> Self {
        Self {
            helper,
            cb,
            current,
            next_index: 0,
            shared: Arc::new(SourceShared::default()),
            source_cache_generator: None,
        }
    }

    pub(crate) fn try_start(&mut self) -> bool {
        let parked = self.shared.data_to_cache.lock().unwrap().take();
        if let Some((load_data, data)) = parked {
            if !self.cache_data(&load_data, data) {
                // Delivered directly.
                return true;
            }
        }

        if let Some(generator) = &mut self.source_cache_generator {
            if generator.try_start() {
                return true;
            }
        }
        self.source_cache_generator = None;

        let strategy = self.helper.strategy();
        while let Some(load_data) = self.helper.load_data().get(self.next_index).cloned() {
            self.next_index += 1;
            let fetcher = &load_data.fetcher;
            if strategy.is_data_cacheable(fetcher.data_source())
                || self.helper.has_load_path(fetcher.data_type())
            {
                self.start_next_load(load_data);
                return true;
            }
        }
        false
    }

    fn start_next_load(&self, load_data: Arc<LoadData>) {
        let original_key: Arc<dyn DiskKey> =
            Arc::new(self.helper.data_cache_key(&load_data.source_key));
        let strategy = self.helper.strategy();
        let shared = self.shared.clone();
        let cb = self.cb.clone();
        let current = self.current.clone();
        let loading = load_data.clone();

        self.current.start(&load_data);
        load_data.fetcher.load_data(
            self.helper.priority(),
            Box::new(move |result| {
                if !current.is_current(&loading) {
                    return;
                }
                let fetcher = loading.fetcher.clone();
                let origin = fetcher.data_source();
                match result {
                    Ok(data) if strategy.is_data_cacheable(origin) => {
                        *shared.data_to_cache.lock().unwrap() = Some((loading.clone(), data));
                        cb.reschedule();
                    }
                    Ok(data) => cb.on_data_fetcher_ready(FetchedData {
                        source_key: loading.source_key.clone(),
                        data,
                        fetcher,
                        origin,
                        attempted_key: original_key,
                    }),
                    Err(e) => cb.on_data_fetcher_failed(original_key, e, fetcher, origin),
                }
            }),
        );
    }

    /// Write parked data to the data disk cache and continue from the new entry.
    ///
    /// Returns false if the data could not be cached and was delivered directly.
    fn cache_data(&mut self, load_data: &Arc<LoadData>, data: Data) -> bool {
        let fetcher = load_data.fetcher.clone();
        let source_key = load_data.source_key.clone();
        let key = self.helper.data_cache_key(&source_key);

        let is_data_in_cache = match self.helper.source_encoder(data.data_type()) {
            Some(encoder) => {
                let options = self.helper.options().clone();
                let mut writer = |file: &Path| encoder.encode(&data, file, &options);
                match self.helper.disk_cache().put(&key, &mut writer) {
                    Ok(()) => self.helper.disk_cache().get(&key).is_some(),
                    Err(e) => {
                        debug!(key = ?key, error = %e, "Failed to write fetched data");
                        false
                    }
                }
            }
            None => {
                warn!(data_type = %data.data_type(), "No source encoder registered");
                false
            }
        };

        if is_data_in_cache {
            fetcher.cleanup();
            let cb = Arc::new(OriginOverride {
                inner: self.cb.clone(),
                origin: fetcher.data_source(),
            });
            self.source_cache_generator = Some(DataCacheGenerator::with_keys(
                vec![source_key],
                self.helper.clone(),
                cb,
                self.current.clone(),
            ));
            return true;
        }

        debug!(key = ?key, "Delivering fetched data without caching it");
        let origin = fetcher.data_source();
        self.cb.on_data_fetcher_ready(FetchedData {
            attempted_key: Arc::new(source_key.clone()),
            source_key,
            data,
            fetcher,
            origin,
        });
        false
    }

    pub(crate) fn cancel(&self) {
        self.current.cancel();
    }
}

/// Reports data read back from a fresh data cache entry as coming from the source.
struct OriginOverride {
    inner: Arc<dyn FetcherReadyCallback>,
    origin: DataSource,
}

impl FetcherReadyCallback for OriginOverride {
    fn reschedule(&self) {
        self.inner.reschedule();
    }

    fn on_data_fetcher_ready(&self, fetched: FetchedData) {
        let attempted_key = Arc::new(fetched.source_key.clone());
        self.inner.on_data_fetcher_ready(FetchedData {
            origin: self.origin,
            attempted_key,
            ..fetched
        });
    }

    fn on_data_fetcher_failed(
        &self,
        attempted_key: Arc<dyn DiskKey>,
        error: FetchError,
        fetcher: Arc<dyn DataFetcher>,
        _origin: DataSource,
    ) {
        self.inner
            .on_data_fetcher_failed(attempted_key, error, fetcher, self.origin);
    }
}
