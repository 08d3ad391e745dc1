//! Engine jobs
//!
//! An [`EngineJob`] coordinates every subscriber waiting for one engine key.
//! It starts the decode job on the right pool, collects subscribers while the
//! load runs and fans the outcome out to each of them on the executor the
//! subscriber picked.
//!
//! The resource is guarded by a pending delivery count: one per scheduled
//! delivery plus one while the deliveries are being scheduled. The job holds
//! an acquisition of the resource while the count is non-zero, so a resource
//! can't be recycled while a delivery is merely queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pixelflow_cache::DataSource;
use pixelflow_scheduler::{EnginePools, Executor};
use tracing::{debug, trace};

use crate::decode_job::{DecodeCallback, DecodeJob, RunReason};
use crate::error::LoadError;
use crate::key::EngineKey;
use crate::resource::{EngineResource, Resource, ResourceListener};

/// A subscriber of a load.
pub trait ResourceCallback: Send + Sync {
    /// Called once with an acquired resource. Release it through the engine when done.
    fn on_resource_ready(
        &self,
        resource: EngineResource,
        origin: DataSource,
        is_from_alternate_key: bool,
    );

    fn on_load_failed(&self, error: Arc<LoadError>);

    /// The subscriber's own lock. Deliveries take it before the job's lock.
    fn lock(&self) -> &Mutex<()>;
}

/// Notified when a job finishes or is cancelled.
pub(crate) trait EngineJobListener: Send + Sync {
    fn on_engine_job_complete(
        &self,
        job: &Arc<EngineJob>,
        key: &EngineKey,
        resource: Option<&EngineResource>,
    );

    fn on_engine_job_cancelled(&self, job: &Arc<EngineJob>, key: &EngineKey);
}

/// Pool selection flags of the request that created the job.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct JobFlags {
    pub is_memory_cacheable: bool,
    pub use_unlimited_source_pool: bool,
    pub use_animation_pool: bool,
    pub only_retrieve_from_cache: bool,
}

#[derive(Clone)]
struct CallbackEntry {
    cb: Arc<dyn ResourceCallback>,
    executor: Arc<dyn Executor>,
}

#[derive(Default)]
struct JobState {
    callbacks: Vec<CallbackEntry>,
    has_resource: bool,
    has_load_failed: bool,
    engine_resource: Option<EngineResource>,
    data_source: Option<DataSource>,
    is_from_alternate_key: bool,
    error: Option<Arc<LoadError>>,
    pending_callbacks: usize,
    decode_job: Option<Arc<DecodeJob>>,
    is_released: bool,
}

impl JobState {
    fn contains(&self, cb: &Arc<dyn ResourceCallback>) -> bool {
        self.callbacks.iter().any(|entry| same_callback(&entry.cb, cb))
    }

    fn detach(&mut self, cb: &Arc<dyn ResourceCallback>) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|entry| !same_callback(&entry.cb, cb));
        self.callbacks.len() != before
    }
}

fn same_callback(a: &Arc<dyn ResourceCallback>, b: &Arc<dyn ResourceCallback>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Result of [`EngineJob::subscribe`].
pub(crate) enum Subscription {
    /// Cancelled or released; the job can't be joined any more.
    Closed,
    /// The outcome is delivered when the load finishes.
    Pending,
    /// The load already finished.
    Finished(Delivery),
}

/// A delivery of a finished job's outcome to a late subscriber.
pub(crate) struct Delivery {
    job: Arc<EngineJob>,
    cb: Arc<dyn ResourceCallback>,
    executor: Arc<dyn Executor>,
    has_resource: bool,
}

impl Delivery {
    /// Schedule the delivery on the subscriber's executor.
    pub(crate) fn dispatch(self) {
        let Delivery {
            job,
            cb,
            executor,
            has_resource,
        } = self;
        if has_resource {
            executor.execute(Box::new(move || job.call_resource_ready(cb)));
        } else {
            executor.execute(Box::new(move || job.call_load_failed(cb)));
        }
    }
}

/// Coordinates the subscribers of one in-flight load.
pub(crate) struct EngineJob {
    key: EngineKey,
    flags: JobFlags,
    pools: Arc<EnginePools>,
    listener: Weak<dyn EngineJobListener>,
    resource_listener: Weak<dyn ResourceListener>,
    is_cancelled: AtomicBool,
    state: Mutex<JobState>,
    me: Weak<EngineJob>,
}

impl EngineJob {
    pub(crate) fn new(
        key: EngineKey,
        flags: JobFlags,
        pools: Arc<EnginePools>,
        listener: Weak<dyn EngineJobListener>,
        resource_listener: Weak<dyn ResourceListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            key,
            flags,
            pools,
            listener,
            resource_listener,
            is_cancelled: AtomicBool::new(false),
            state: Mutex::new(JobState::default()),
            me: me.clone(),
        })
    }

    pub(crate) fn key(&self) -> &EngineKey {
        &self.key
    }

    pub(crate) fn only_retrieve_from_cache(&self) -> bool {
        self.flags.only_retrieve_from_cache
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn callback_count(&self) -> usize {
        self.state.lock().unwrap().callbacks.len()
    }

    fn active_source_executor(&self) -> &Arc<dyn Executor> {
        self.pools.source_for(
            self.flags.use_unlimited_source_pool,
            self.flags.use_animation_pool,
        )
    }

    /// Run `decode_job` on the disk cache pool if it starts from the disk cache,
    /// otherwise on the request's source pool. Does nothing once cancelled.
    pub(crate) fn start(&self, decode_job: Arc<DecodeJob>) {
        let executor = if decode_job.will_decode_from_cache() {
            self.pools.disk_cache()
        } else {
            self.active_source_executor()
        }
        .clone();
        {
            let mut state = self.state.lock().unwrap();
            if self.is_cancelled() {
                trace!(key = %self.key, "Engine job cancelled before it started");
                return;
            }
            state.decode_job = Some(decode_job.clone());
        }

        trace!(key = %self.key, "Starting engine job");
        let priority = decode_job.priority();
        executor.execute_with_priority(
            priority,
            Box::new(move || decode_job.run(RunReason::Initialize)),
        );
    }

    /// Attach `cb`, delivering on `executor`, without running anything.
    ///
    /// A finished job hands back a [`Delivery`] the caller must dispatch once
    /// it holds no locks of its own.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        cb: Arc<dyn ResourceCallback>,
        executor: Arc<dyn Executor>,
    ) -> Subscription {
        let mut state = self.state.lock().unwrap();
        if state.is_released || self.is_cancelled() {
            return Subscription::Closed;
        }
        state.callbacks.push(CallbackEntry {
            cb: cb.clone(),
            executor: executor.clone(),
        });
        if !state.has_resource && !state.has_load_failed {
            return Subscription::Pending;
        }

        self.increment_pending(&mut state, 1);
        Subscription::Finished(Delivery {
            job: self.clone(),
            cb,
            executor,
            has_resource: state.has_resource,
        })
    }

    /// Subscribe `cb`, delivering on `executor`.
    ///
    /// Returns false if the job was cancelled or released and can no longer be joined.
    #[cfg(test)]
    pub(crate) fn add_callback(
        self: &Arc<Self>,
        cb: Arc<dyn ResourceCallback>,
        executor: Arc<dyn Executor>,
    ) -> bool {
        match self.subscribe(cb, executor) {
            Subscription::Closed => false,
            Subscription::Pending => true,
            Subscription::Finished(delivery) => {
                delivery.dispatch();
                true
            }
        }
    }

    /// Unsubscribe `cb`. Cancels the load once nobody is left waiting for it.
    pub(crate) fn remove_callback(self: &Arc<Self>, cb: &Arc<dyn ResourceCallback>) {
        let decode_job = {
            let mut state = self.state.lock().unwrap();
            if !state.detach(cb) || !state.callbacks.is_empty() {
                return;
            }
            if self.is_done(&state) {
                if state.pending_callbacks == 0 && !state.is_released {
                    self.release(&mut state);
                }
                return;
            }
            if self.is_cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            state.decode_job.clone()
        };

        debug!(key = %self.key, "Cancelling engine job");
        if let Some(decode_job) = decode_job {
            decode_job.cancel();
        }
        if let Some(listener) = self.listener.upgrade() {
            listener.on_engine_job_cancelled(self, &self.key);
        }
    }

    fn is_done(&self, state: &JobState) -> bool {
        state.has_resource || state.has_load_failed || self.is_cancelled()
    }

    fn call_resource_ready(self: &Arc<Self>, cb: Arc<dyn ResourceCallback>) {
        // Lock order: the subscriber's lock, then the job's.
        let _cb_guard = cb.lock().lock().unwrap();
        let delivery = {
            let mut state = self.state.lock().unwrap();
            match state.engine_resource.clone() {
                Some(resource) if state.contains(&cb) => {
                    resource.acquire();
                    state.detach(&cb);
                    let origin = state.data_source.unwrap_or(DataSource::Local);
                    Some((resource, origin, state.is_from_alternate_key))
                }
                _ => None,
            }
        };
        if let Some((resource, origin, is_from_alternate_key)) = delivery {
            cb.on_resource_ready(resource, origin, is_from_alternate_key);
        }
        self.decrement_pending();
    }

    fn call_load_failed(self: &Arc<Self>, cb: Arc<dyn ResourceCallback>) {
        // Lock order: the subscriber's lock, then the job's.
        let _cb_guard = cb.lock().lock().unwrap();
        let error = {
            let mut state = self.state.lock().unwrap();
            match state.error.clone() {
                Some(error) if state.contains(&cb) => {
                    state.detach(&cb);
                    Some(error)
                }
                _ => None,
            }
        };
        if let Some(error) = error {
            cb.on_load_failed(error);
        }
        self.decrement_pending();
    }

    fn increment_pending(&self, state: &mut JobState, count: usize) {
        assert!(self.is_done(state), "Not yet complete!");
        if state.pending_callbacks == 0 {
            if let Some(resource) = &state.engine_resource {
                resource.acquire();
            }
        }
        state.pending_callbacks += count;
    }

    fn decrement_pending(&self) {
        let to_release = {
            let mut state = self.state.lock().unwrap();
            assert!(self.is_done(&state), "Not yet complete!");
            assert!(state.pending_callbacks > 0, "Can't decrement below 0");
            state.pending_callbacks -= 1;
            if state.pending_callbacks == 0 {
                let resource = state.engine_resource.take();
                self.release(&mut state);
                resource
            } else {
                None
            }
        };
        if let Some(resource) = to_release {
            resource.release();
        }
    }

    fn release(&self, state: &mut JobState) {
        assert!(!state.is_released, "Engine job already released");
        trace!(key = %self.key, "Releasing engine job");
        state.is_released = true;
        state.callbacks.clear();
        state.engine_resource = None;
        state.decode_job = None;
        state.error = None;
    }

    fn notify_resource_ready(
        self: &Arc<Self>,
        resource: Arc<dyn Resource>,
        origin: DataSource,
        is_from_alternate_key: bool,
    ) {
        let (entries, engine_resource) = {
            let mut state = self.state.lock().unwrap();
            if self.is_cancelled() {
                self.release(&mut state);
                drop(state);
                resource.recycle();
                return;
            }
            if state.callbacks.is_empty() {
                panic!("Received a resource without any callbacks to notify");
            }
            if state.has_resource {
                panic!("Already have resource");
            }
            let engine_resource = EngineResource::new(
                resource,
                self.flags.is_memory_cacheable,
                true,
                self.key.clone(),
                Some(self.resource_listener.clone()),
            );
            state.has_resource = true;
            state.engine_resource = Some(engine_resource.clone());
            state.data_source = Some(origin);
            state.is_from_alternate_key = is_from_alternate_key;

            let entries = state.callbacks.clone();
            self.increment_pending(&mut state, entries.len() + 1);
            (entries, engine_resource)
        };

        if let Some(listener) = self.listener.upgrade() {
            listener.on_engine_job_complete(self, &self.key, Some(&engine_resource));
        }
        for entry in entries {
            let job = self.clone();
            let cb = entry.cb;
            entry
                .executor
                .execute(Box::new(move || job.call_resource_ready(cb)));
        }
        self.decrement_pending();
    }

    fn notify_load_failed(self: &Arc<Self>, error: LoadError) {
        let entries = {
            let mut state = self.state.lock().unwrap();
            if self.is_cancelled() {
                self.release(&mut state);
                return;
            }
            if state.callbacks.is_empty() {
                panic!("Received an exception without any callbacks to notify");
            }
            if state.has_load_failed {
                panic!("Already failed once");
            }
            state.has_load_failed = true;
            state.error = Some(Arc::new(error));

            let entries = state.callbacks.clone();
            self.increment_pending(&mut state, entries.len() + 1);
            entries
        };

        if let Some(listener) = self.listener.upgrade() {
            listener.on_engine_job_complete(self, &self.key, None);
        }
        for entry in entries {
            let job = self.clone();
            let cb = entry.cb;
            entry
                .executor
                .execute(Box::new(move || job.call_load_failed(cb)));
        }
        self.decrement_pending();
    }
}

impl DecodeCallback for EngineJob {
    fn on_resource_ready(
        &self,
        resource: Arc<dyn Resource>,
        origin: DataSource,
        is_from_alternate_key: bool,
    ) {
        match self.me.upgrade() {
            Some(job) => job.notify_resource_ready(resource, origin, is_from_alternate_key),
            None => resource.recycle(),
        }
    }

    fn on_load_failed(&self, error: LoadError) {
        if let Some(job) = self.me.upgrade() {
            job.notify_load_failed(error);
        }
    }

    fn reschedule(&self, job: Arc<DecodeJob>, reason: RunReason) {
        let priority = job.priority();
        self.active_source_executor()
            .execute_with_priority(priority, Box::new(move || job.run(reason)));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resource::tests::{test_key, CountingResource};
    use std::sync::atomic::AtomicUsize;

    /// A subscriber that records what it was given.
    #[derive(Default)]
    pub(crate) struct RecordingCallback {
        pub lock: Mutex<()>,
        pub ready: Mutex<Vec<EngineResource>>,
        pub origins: Mutex<Vec<DataSource>>,
        pub failed: Mutex<Vec<Arc<LoadError>>>,
        pub lock_held_during_delivery: AtomicBool,
    }

    impl RecordingCallback {
        pub(crate) fn ready_count(&self) -> usize {
            self.ready.lock().unwrap().len()
        }

        pub(crate) fn failed_count(&self) -> usize {
            self.failed.lock().unwrap().len()
        }
    }

    impl ResourceCallback for RecordingCallback {
        fn on_resource_ready(
            &self,
            resource: EngineResource,
            origin: DataSource,
            _is_from_alternate_key: bool,
        ) {
            self.lock_held_during_delivery
                .store(self.lock.try_lock().is_err(), Ordering::SeqCst);
            self.origins.lock().unwrap().push(origin);
            self.ready.lock().unwrap().push(resource);
        }

        fn on_load_failed(&self, error: Arc<LoadError>) {
            self.failed.lock().unwrap().push(error);
        }

        fn lock(&self) -> &Mutex<()> {
            &self.lock
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        completed: AtomicUsize,
        cancelled: AtomicUsize,
        released: Mutex<Vec<EngineResource>>,
    }

    impl EngineJobListener for RecordingListener {
        fn on_engine_job_complete(
            &self,
            _job: &Arc<EngineJob>,
            _key: &EngineKey,
            _resource: Option<&EngineResource>,
        ) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_engine_job_cancelled(&self, _job: &Arc<EngineJob>, _key: &EngineKey) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ResourceListener for RecordingListener {
        fn on_resource_released(&self, _key: &EngineKey, resource: EngineResource) {
            self.released.lock().unwrap().push(resource);
        }
    }

    fn job(listener: &Arc<RecordingListener>) -> Arc<EngineJob> {
        let job_listener = Arc::downgrade(listener);
        let job_listener: Weak<dyn EngineJobListener> = job_listener;
        let resource_listener = Arc::downgrade(listener);
        let resource_listener: Weak<dyn ResourceListener> = resource_listener;
        EngineJob::new(
            test_key("job"),
            JobFlags {
                is_memory_cacheable: true,
                ..JobFlags::default()
            },
            Arc::new(EnginePools::direct()),
            job_listener,
            resource_listener,
        )
    }

    fn direct() -> Arc<dyn Executor> {
        Arc::new(pixelflow_scheduler::DirectExecutor)
    }

    fn subscribe(job: &Arc<EngineJob>) -> Arc<RecordingCallback> {
        let cb = Arc::new(RecordingCallback::default());
        assert!(job.add_callback(cb.clone(), direct()));
        cb
    }

    #[test]
    fn test_resource_is_delivered_to_every_subscriber() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let first = subscribe(&job);
        let second = subscribe(&job);

        job.on_resource_ready(CountingResource::with_size(10), DataSource::Remote, false);

        assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
        let a = first.ready.lock().unwrap()[0].clone();
        let b = second.ready.lock().unwrap()[0].clone();
        assert_eq!(a, b);
        // One acquisition per subscriber; the job let go of its own.
        assert_eq!(a.acquired(), 2);
        assert!(first.lock_held_during_delivery.load(Ordering::SeqCst));
        assert_eq!(job.callback_count(), 0);

        a.release();
        b.release();
        assert_eq!(listener.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_late_subscriber_gets_the_result() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let queued = Arc::new(QueueExecutor::default());
        let early = Arc::new(RecordingCallback::default());
        assert!(job.add_callback(early.clone(), queued.clone()));
        job.on_resource_ready(CountingResource::with_size(10), DataSource::Local, false);

        // The early delivery is still queued, so the job can still be joined.
        let late = subscribe(&job);
        assert_eq!(late.ready_count(), 1);
        assert_eq!(queued.run_all(), 1);
        assert_eq!(early.ready_count(), 1);
        assert_eq!(late.ready.lock().unwrap()[0].acquired(), 2);

        // Every delivery ran and the job was released.
        assert!(!job.add_callback(Arc::new(RecordingCallback::default()), direct()));
    }

    #[test]
    fn test_failure_is_shared() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let first = subscribe(&job);
        let second = subscribe(&job);

        job.on_load_failed(LoadError::new("Failed to load resource", Vec::new()));

        assert_eq!(first.failed_count(), 1);
        assert_eq!(second.failed_count(), 1);
        assert!(Arc::ptr_eq(
            &first.failed.lock().unwrap()[0],
            &second.failed.lock().unwrap()[0]
        ));
        assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removing_last_subscriber_cancels() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let cb = subscribe(&job);
        let as_dyn: Arc<dyn ResourceCallback> = cb.clone();

        job.remove_callback(&as_dyn);
        job.remove_callback(&as_dyn);
        assert!(job.is_cancelled());
        assert_eq!(listener.cancelled.load(Ordering::SeqCst), 1);
        assert!(!job.add_callback(cb.clone(), direct()));

        // A result arriving after the cancel is recycled, not delivered.
        let payload = CountingResource::with_size(4);
        job.on_resource_ready(payload.clone(), DataSource::Remote, false);
        assert_eq!(payload.recycle_count(), 1);
        assert_eq!(cb.ready_count(), 0);
        assert_eq!(listener.completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removing_one_of_two_subscribers_keeps_running() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let first = subscribe(&job);
        let second = subscribe(&job);
        let as_dyn: Arc<dyn ResourceCallback> = first.clone();

        job.remove_callback(&as_dyn);
        assert!(!job.is_cancelled());

        job.on_resource_ready(CountingResource::with_size(4), DataSource::Remote, false);
        assert_eq!(first.ready_count(), 0);
        assert_eq!(second.ready_count(), 1);
    }

    #[test]
    #[should_panic(expected = "Already have resource")]
    fn test_second_resource_panics() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let cb = Arc::new(RecordingCallback::default());
        job.add_callback(cb.clone(), direct());
        // Keep the job alive past the first delivery with a queued subscriber.
        let queued = Arc::new(QueueExecutor::default());
        job.add_callback(Arc::new(RecordingCallback::default()), queued.clone());

        job.on_resource_ready(CountingResource::with_size(1), DataSource::Remote, false);
        job.on_resource_ready(CountingResource::with_size(1), DataSource::Remote, false);
    }

    #[test]
    #[should_panic(expected = "without any callbacks")]
    fn test_result_without_subscribers_panics() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        job.on_load_failed(LoadError::new("boom", Vec::new()));
    }

    #[test]
    fn test_queued_delivery_keeps_resource_acquired() {
        let listener = Arc::new(RecordingListener::default());
        let job = job(&listener);
        let queued = Arc::new(QueueExecutor::default());
        let cb = Arc::new(RecordingCallback::default());
        job.add_callback(cb.clone(), queued.clone());

        let payload = CountingResource::with_size(8);
        job.on_resource_ready(payload.clone(), DataSource::Remote, false);
        assert_eq!(cb.ready_count(), 0);
        assert!(listener.released.lock().unwrap().is_empty());

        assert_eq!(queued.run_all(), 1);
        let resource = cb.ready.lock().unwrap()[0].clone();
        assert_eq!(resource.acquired(), 1);
        resource.release();
        assert_eq!(listener.released.lock().unwrap().len(), 1);
        assert_eq!(payload.recycle_count(), 0);
    }

    /// Queues tasks until the test runs them.
    #[derive(Default)]
    pub(crate) struct QueueExecutor {
        tasks: Mutex<Vec<pixelflow_scheduler::Task>>,
    }

    impl QueueExecutor {
        pub(crate) fn run_all(&self) -> usize {
            let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
            let count = tasks.len();
            for task in tasks {
                task();
            }
            count
        }
    }

    impl Executor for QueueExecutor {
        fn execute(&self, task: pixelflow_scheduler::Task) {
            self.tasks.lock().unwrap().push(task);
        }
    }
}
