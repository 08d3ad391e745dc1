//! Execution contexts and the engine's named pool set
//!
//! Every piece of asynchronous work in the engine runs through an
//! [`Executor`]. [`EnginePools`] bundles the contexts the engine needs: a
//! strictly serial disk cache pool, a bounded source pool, an unbounded source
//! pool for bursts, a small animation pool and the single delivery context
//! onto which subscriber callbacks are posted.

use std::sync::Arc;

use tracing::debug;

use crate::priority::Priority;
use crate::worker::{num_cpus, WorkerPool, WorkerPoolConfig};

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs tasks, now or later, on some thread.
pub trait Executor: Send + Sync {
    /// Run `task`.
    fn execute(&self, task: Task);

    /// Run `task`, letting executors with a queue order it by `priority`.
    fn execute_with_priority(&self, priority: Priority, task: Task) {
        let _ = priority;
        self.execute(task);
    }

    /// Stop accepting work. Executors without threads do nothing.
    fn shutdown(&self) {}
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Upper bound for the default size of the bounded source pool.
const MAX_DEFAULT_SOURCE_THREADS: usize = 4;

/// Default size of the bounded source pool.
pub fn default_source_threads() -> usize {
    num_cpus().min(MAX_DEFAULT_SOURCE_THREADS)
}

/// Default size of the animation pool.
pub fn default_animation_threads() -> usize {
    if num_cpus() > 4 {
        2
    } else {
        1
    }
}

/// The execution contexts used by the engine.
#[derive(Clone)]
pub struct EnginePools {
    disk_cache: Arc<dyn Executor>,
    source: Arc<dyn Executor>,
    unlimited_source: Arc<dyn Executor>,
    animation: Arc<dyn Executor>,
    main: Arc<dyn Executor>,
}

impl EnginePools {
    /// Create thread-backed pools.
    ///
    /// `None` sizes pick defaults from the CPU count.
    pub fn new(source_threads: Option<usize>, animation_threads: Option<usize>) -> Self {
        let source_threads = source_threads.unwrap_or_else(default_source_threads);
        let animation_threads = animation_threads.unwrap_or_else(default_animation_threads);
        debug!(source_threads, animation_threads, "Creating engine pools");

        Self {
            disk_cache: Arc::new(WorkerPool::new(WorkerPoolConfig::fixed(
                "pixelflow-disk-cache",
                1,
            ))),
            source: Arc::new(WorkerPool::new(WorkerPoolConfig::fixed(
                "pixelflow-source",
                source_threads,
            ))),
            unlimited_source: Arc::new(WorkerPool::new(WorkerPoolConfig::unbounded(
                "pixelflow-source-unlimited",
            ))),
            animation: Arc::new(WorkerPool::new(WorkerPoolConfig::fixed(
                "pixelflow-animation",
                animation_threads,
            ))),
            main: Arc::new(WorkerPool::new(WorkerPoolConfig::fixed("pixelflow-main", 1))),
        }
    }

    /// Assemble pools from arbitrary executors.
    pub fn from_executors(
        disk_cache: Arc<dyn Executor>,
        source: Arc<dyn Executor>,
        unlimited_source: Arc<dyn Executor>,
        animation: Arc<dyn Executor>,
        main: Arc<dyn Executor>,
    ) -> Self {
        Self {
            disk_cache,
            source,
            unlimited_source,
            animation,
            main,
        }
    }

    /// Every context runs tasks inline on the calling thread.
    pub fn direct() -> Self {
        let direct: Arc<dyn Executor> = Arc::new(DirectExecutor);
        Self::from_executors(
            direct.clone(),
            direct.clone(),
            direct.clone(),
            direct.clone(),
            direct,
        )
    }

    /// Serial pool for work resolved from the disk cache.
    pub fn disk_cache(&self) -> &Arc<dyn Executor> {
        &self.disk_cache
    }

    /// Source pool selected by request flags.
    ///
    /// The unlimited pool wins over the animation pool.
    pub fn source_for(&self, use_unlimited: bool, use_animation: bool) -> &Arc<dyn Executor> {
        if use_unlimited {
            &self.unlimited_source
        } else if use_animation {
            &self.animation
        } else {
            &self.source
        }
    }

    /// The delivery context.
    pub fn main(&self) -> &Arc<dyn Executor> {
        &self.main
    }

    /// Shut every pool down.
    pub fn shutdown(&self) {
        self.disk_cache.shutdown();
        self.source.shutdown();
        self.unlimited_source.shutdown();
        self.animation.shutdown();
        self.main.shutdown();
    }
}
