//! Decode job
//!
//! Drives the generators of one load through their stages, decodes the data
//! the first successful fetch produces, applies the transformation, reports
//! the result and writes it to the resource disk cache when the strategy asks
//! for it.
//!
//! Only one thread drives a job at a time. Fetcher callbacks that arrive on
//! the driving thread are queued and consumed by the driver loop; callbacks
//! from any other thread park their result and reschedule the job, so the
//! generators are never touched concurrently.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use pixelflow_cache::{DataSource, DiskKey, EncodeStrategy};
use pixelflow_scheduler::{CancellationToken, Priority};
use tracing::{debug, trace};

use crate::error::{FetchError, LoadError};
use crate::fetcher::{Data, DataFetcher};
use crate::generator::{
    CurrentLoad, DataCacheGenerator, FetchedData, FetcherReadyCallback, Generator,
    ResourceCacheGenerator, SourceGenerator,
};
use crate::helper::DecodeHelper;
use crate::key::EngineKey;
use crate::locked::LockedResource;
use crate::resource::Resource;

/// Why a decode job is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunReason {
    /// First run.
    Initialize,
    /// Continue with the generators, on a source pool.
    SwitchToSource,
    /// Decode data a fetcher delivered on another thread.
    DecodeData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Initialize,
    ResourceCache,
    DataCache,
    Source,
    Encode,
    Finished,
}

/// Receives the outcome of a decode job.
pub(crate) trait DecodeCallback: Send + Sync {
    fn on_resource_ready(
        &self,
        resource: Arc<dyn Resource>,
        origin: DataSource,
        is_from_alternate_key: bool,
    );

    fn on_load_failed(&self, error: LoadError);

    /// Run `job` again with `reason` on the appropriate pool.
    fn reschedule(&self, job: Arc<DecodeJob>, reason: RunReason);
}

/// Fetcher outcome that arrived on the driving thread.
enum Event {
    Ready(FetchedData),
    Failed,
    Reschedule,
}

struct DriverState {
    stage: Stage,
    generator: Option<Generator>,
}

/// Runs the fallback chain for one engine key.
pub(crate) struct DecodeJob {
    helper: Arc<DecodeHelper>,
    key: EngineKey,
    callback: Weak<dyn DecodeCallback>,
    fetch_callback: Arc<dyn FetcherReadyCallback>,
    cancelled: CancellationToken,
    current_load: CurrentLoad,
    driver: Mutex<DriverState>,
    running_thread: Mutex<Option<ThreadId>>,
    inbox: Mutex<Option<Event>>,
    async_retrieved: Mutex<Option<FetchedData>>,
    throwables: Mutex<Vec<FetchError>>,
    is_callback_notified: AtomicBool,
}

impl DecodeJob {
    pub(crate) fn new(
        helper: Arc<DecodeHelper>,
        key: EngineKey,
        callback: Weak<dyn DecodeCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|job| Self {
            helper,
            key,
            callback,
            fetch_callback: Arc::new(JobCallback(job.clone())),
            cancelled: CancellationToken::new(),
            current_load: CurrentLoad::default(),
            driver: Mutex::new(DriverState {
                stage: Stage::Initialize,
                generator: None,
            }),
            running_thread: Mutex::new(None),
            inbox: Mutex::new(None),
            async_retrieved: Mutex::new(None),
            throwables: Mutex::new(Vec::new()),
            is_callback_notified: AtomicBool::new(false),
        })
    }

    pub(crate) fn priority(&self) -> Priority {
        self.helper.priority()
    }

    /// True if the first stage reads from the disk cache, so the job can start on the disk pool.
    pub(crate) fn will_decode_from_cache(&self) -> bool {
        matches!(
            self.next_stage(Stage::Initialize),
            Stage::ResourceCache | Stage::DataCache
        )
    }

    /// Stop the job. Safe from any thread; the live fetch is cancelled too.
    pub(crate) fn cancel(&self) {
        if self.cancelled.cancel() {
            trace!(key = %self.key, "Cancelling decode job");
        }
        self.current_load.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Drive the job, then hand it back to the callback if it has to continue elsewhere.
    pub(crate) fn run(self: &Arc<Self>, reason: RunReason) {
        let next = {
            let mut state = self.driver.lock().unwrap();
            *self.running_thread.lock().unwrap() = Some(thread::current().id());
            let next = if self.cancelled.is_cancelled() {
                if let Some(fetched) = self.async_retrieved.lock().unwrap().take() {
                    fetched.fetcher.cleanup();
                }
                self.notify_failed();
                None
            } else {
                self.drive(&mut state, reason)
            };
            *self.running_thread.lock().unwrap() = None;
            next
        };

        if let Some(reason) = next {
            self.reschedule(reason);
        }
    }

    fn reschedule(self: &Arc<Self>, reason: RunReason) {
        if let Some(callback) = self.callback.upgrade() {
            callback.reschedule(self.clone(), reason);
        }
    }

    fn is_driver_thread(&self) -> bool {
        *self.running_thread.lock().unwrap() == Some(thread::current().id())
    }

    fn drive(&self, state: &mut DriverState, reason: RunReason) -> Option<RunReason> {
        match reason {
            RunReason::Initialize => {
                state.stage = self.next_stage(Stage::Initialize);
                state.generator = self.generator_for(state.stage);
                debug!(key = %self.key, stage = ?state.stage, "Starting decode job");
            }
            RunReason::SwitchToSource => {}
            RunReason::DecodeData => {
                let fetched = self.async_retrieved.lock().unwrap().take();
                if let Some(fetched) = fetched {
                    if self.decode_from_retrieved(state, fetched) {
                        return None;
                    }
                }
            }
        }
        self.run_generators(state)
    }

    fn run_generators(&self, state: &mut DriverState) -> Option<RunReason> {
        loop {
            if self.cancelled.is_cancelled() {
                if let Some(generator) = &state.generator {
                    generator.cancel();
                }
                self.notify_failed();
                return None;
            }

            let Some(generator) = state.generator.as_mut() else {
                self.notify_failed();
                return None;
            };

            match generator.try_start() {
                Err(e) => {
                    debug!(key = %self.key, error = %e, "Generator failed");
                    self.throwables.lock().unwrap().push(e);
                    state.stage = Stage::Finished;
                    state.generator = None;
                }
                Ok(true) => {
                    let event = self.inbox.lock().unwrap().take();
                    match event {
                        Some(Event::Ready(fetched)) => {
                            if self.decode_from_retrieved(state, fetched) {
                                return None;
                            }
                        }
                        Some(Event::Failed) => {}
                        Some(Event::Reschedule) => return Some(RunReason::SwitchToSource),
                        // The fetch completes on another thread.
                        None => return None,
                    }
                }
                Ok(false) => {
                    state.stage = self.next_stage(state.stage);
                    state.generator = self.generator_for(state.stage);
                    trace!(key = %self.key, stage = ?state.stage, "Next stage");
                    if state.stage == Stage::Source {
                        return Some(RunReason::SwitchToSource);
                    }
                }
            }
        }
    }

    fn next_stage(&self, current: Stage) -> Stage {
        let strategy = self.helper.strategy();
        match current {
            Stage::Initialize if strategy.decode_cached_resource() => Stage::ResourceCache,
            Stage::Initialize => self.next_stage(Stage::ResourceCache),
            Stage::ResourceCache if strategy.decode_cached_data() => Stage::DataCache,
            Stage::ResourceCache => self.next_stage(Stage::DataCache),
            Stage::DataCache if self.helper.only_retrieve_from_cache() => Stage::Finished,
            Stage::DataCache => Stage::Source,
            Stage::Source | Stage::Encode | Stage::Finished => Stage::Finished,
        }
    }

    fn generator_for(&self, stage: Stage) -> Option<Generator> {
        let helper = self.helper.clone();
        let cb = self.fetch_callback.clone();
        let current = self.current_load.clone();
        match stage {
            Stage::ResourceCache => Some(Generator::ResourceCache(ResourceCacheGenerator::new(
                helper, cb, current,
            ))),
            Stage::DataCache => Some(Generator::DataCache(DataCacheGenerator::new(
                helper, cb, current,
            ))),
            Stage::Source => Some(Generator::Source(SourceGenerator::new(helper, cb, current))),
            Stage::Initialize | Stage::Encode | Stage::Finished => None,
        }
    }

    /// Decode fetched data and report it. Returns false if decoding failed.
    fn decode_from_retrieved(&self, state: &mut DriverState, fetched: FetchedData) -> bool {
        let FetchedData {
            source_key,
            data,
            fetcher,
            origin,
            attempted_key,
        } = fetched;
        trace!(key = %self.key, source = ?origin, "Decoding retrieved data");

        let decoded = self.decode(&data, origin);
        fetcher.cleanup();
        let resource = match decoded {
            Ok(resource) => resource,
            Err(e) => {
                debug!(key = %self.key, error = %e, "Failed to decode retrieved data");
                self.throwables
                    .lock()
                    .unwrap()
                    .push(e.attempt(&attempted_key, origin));
                return false;
            }
        };

        let helper = &self.helper;
        let is_from_alternate_key = !helper.is_source_key(&source_key);
        let encoder = helper.result_encoder();
        let encode_strategy = encoder
            .as_ref()
            .map_or(EncodeStrategy::None, |encoder| {
                encoder.encode_strategy(helper.options())
            });

        let mut to_encode = None;
        let mut result = resource;
        if helper
            .strategy()
            .is_resource_cacheable(is_from_alternate_key, origin, encode_strategy)
        {
            let Some(encoder) = encoder else {
                let error = FetchError::NoResultEncoder(helper.resource_type().to_string());
                self.throwables
                    .lock()
                    .unwrap()
                    .push(error.attempt(&attempted_key, origin));
                result.recycle();
                return false;
            };
            let key: Option<Box<dyn DiskKey>> = match encode_strategy {
                EncodeStrategy::Source => Some(Box::new(helper.data_cache_key(&source_key))),
                EncodeStrategy::Transformed => Some(Box::new(
                    helper.resource_cache_key(&source_key, helper.resource_type()),
                )),
                EncodeStrategy::None => None,
            };
            if let Some(key) = key {
                let locked = LockedResource::obtain(result);
                result = locked.clone();
                to_encode = Some((key, locked, encoder));
            }
        }

        state.stage = Stage::Encode;
        state.generator = None;
        self.notify_complete(result, origin, is_from_alternate_key);

        if let Some((key, locked, encoder)) = to_encode {
            let options = helper.options().clone();
            let mut writer =
                |file: &Path| encoder.encode(locked.inner().as_ref(), file, &options);
            if helper.disk_cache().put(key.as_ref(), &mut writer).is_ok() {
                trace!(key = ?key, "Encoded resource to disk cache");
            }
            locked.unlock();
        }
        state.stage = Stage::Finished;
        true
    }

    fn decode(&self, data: &Data, origin: DataSource) -> Result<Arc<dyn Resource>, FetchError> {
        let helper = &self.helper;
        let load_path =
            helper
                .load_path(data.data_type())
                .ok_or_else(|| FetchError::NoLoadPath {
                    from: data.data_type().to_string(),
                    to: helper.resource_type().to_string(),
                })?;
        let decoded = load_path.load(data, helper.width(), helper.height(), helper.options())?;

        // Resource cache entries are stored transformed.
        if origin == DataSource::ResourceDiskCache {
            return Ok(decoded);
        }
        let Some(transformation) = helper.transformation(helper.resource_type()) else {
            return Ok(decoded);
        };
        let transformed =
            transformation.transform(decoded.clone(), helper.width(), helper.height())?;
        if !same_payload(&transformed, &decoded) {
            decoded.recycle();
        }
        Ok(transformed)
    }

    fn notify_complete(
        &self,
        resource: Arc<dyn Resource>,
        origin: DataSource,
        is_from_alternate_key: bool,
    ) {
        if self.is_callback_notified.swap(true, Ordering::AcqRel) {
            debug!(key = %self.key, "Decode job already notified");
            return;
        }
        debug!(key = %self.key, source = ?origin, "Loaded resource");
        if let Some(callback) = self.callback.upgrade() {
            callback.on_resource_ready(resource, origin, is_from_alternate_key);
        }
    }

    fn notify_failed(&self) {
        if self.is_callback_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let causes = std::mem::take(&mut *self.throwables.lock().unwrap());
        let error = LoadError::new("Failed to load resource", causes);
        debug!(key = %self.key, error = %error, "Load failed");
        if let Some(callback) = self.callback.upgrade() {
            callback.on_load_failed(error);
        }
    }
}

fn same_payload(a: &Arc<dyn Resource>, b: &Arc<dyn Resource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Routes generator results back into the job that started the fetch.
struct JobCallback(Weak<DecodeJob>);

impl FetcherReadyCallback for JobCallback {
    fn reschedule(&self) {
        let Some(job) = self.0.upgrade() else {
            return;
        };
        if job.is_driver_thread() {
            *job.inbox.lock().unwrap() = Some(Event::Reschedule);
        } else {
            job.reschedule(RunReason::SwitchToSource);
        }
    }

    fn on_data_fetcher_ready(&self, fetched: FetchedData) {
        let Some(job) = self.0.upgrade() else {
            fetched.fetcher.cleanup();
            return;
        };
        if job.is_driver_thread() {
            *job.inbox.lock().unwrap() = Some(Event::Ready(fetched));
        } else {
            *job.async_retrieved.lock().unwrap() = Some(fetched);
            job.reschedule(RunReason::DecodeData);
        }
    }

    fn on_data_fetcher_failed(
        &self,
        attempted_key: Arc<dyn DiskKey>,
        error: FetchError,
        fetcher: Arc<dyn DataFetcher>,
        origin: DataSource,
    ) {
        fetcher.cleanup();
        let Some(job) = self.0.upgrade() else {
            return;
        };
        debug!(key = ?attempted_key, source = ?origin, error = %error, "Fetching data failed");
        job.throwables
            .lock()
            .unwrap()
            .push(error.attempt(&attempted_key, origin));
        if job.is_driver_thread() {
            *job.inbox.lock().unwrap() = Some(Event::Failed);
        } else {
            job.reschedule(RunReason::SwitchToSource);
        }
    }
}
