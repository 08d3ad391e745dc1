//! Worker pools for parallel task execution.
//!
//! A pool owns a priority queue of tasks and a set of named worker threads.
//! Workers are spawned lazily as tasks arrive, up to `max_workers`. Workers
//! beyond `core_workers` exit after sitting idle for `keep_alive`, which lets
//! one type serve both the small fixed pools and the unbounded burst pool.

use std::any::Any;
use std::panic;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::executor::{Executor, Task};
use crate::priority::{Priority, TaskQueue};

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix for worker thread names.
    pub name: String,

    /// Workers kept alive while idle.
    pub core_workers: usize,

    /// Upper bound on concurrently running workers.
    pub max_workers: usize,

    /// How long a non-core worker waits for work before exiting.
    /// Default: 10s.
    pub keep_alive: Duration,
}

impl WorkerPoolConfig {
    /// A pool with exactly `num_workers` workers.
    pub fn fixed(name: impl Into<String>, num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        Self {
            name: name.into(),
            core_workers: num_workers,
            max_workers: num_workers,
            keep_alive: Duration::from_secs(10),
        }
    }

    /// A pool that starts a new worker whenever every existing worker is busy.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            core_workers: 0,
            max_workers: usize::MAX,
            keep_alive: Duration::from_secs(10),
        }
    }

    /// Set how long idle non-core workers linger.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Internal pool state
struct PoolState {
    queue: TaskQueue,
    workers: usize,
    idle: usize,
    next_worker_id: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
    /// First panic of an exited worker, raised again by `shutdown`.
    panic: Option<Box<dyn Any + Send>>,
}

impl PoolState {
    /// Join workers that already exited.
    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
            .into_iter()
            .partition(|handle| handle.is_finished());
        self.handles = running;
        for handle in finished {
            if let Err(payload) = handle.join() {
                self.panic.get_or_insert(payload);
            }
        }
    }
}

struct Shared {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    work_available: Condvar,
}

/// Thread pool executing boxed tasks in priority order.
///
/// # Example
///
/// ```
/// use pixelflow_scheduler::{Executor, WorkerPool, WorkerPoolConfig};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(WorkerPoolConfig::fixed("example", 2));
/// let (tx, rx) = mpsc::channel();
/// pool.execute(Box::new(move || tx.send(42).unwrap()));
/// assert_eq!(rx.recv().unwrap(), 42);
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool; no threads are started until work arrives.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    queue: TaskQueue::new(),
                    workers: 0,
                    idle: 0,
                    next_worker_id: 0,
                    shutdown: false,
                    handles: Vec::new(),
                    panic: None,
                }),
                work_available: Condvar::new(),
            }),
        }
    }

    /// Name used as the worker thread prefix.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Get the number of live worker threads.
    pub fn num_workers(&self) -> usize {
        self.shared.state.lock().unwrap().workers
    }

    /// Get the number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Check if the worker pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().unwrap().shutdown
    }

    /// Queue a task at the given priority.
    pub fn submit(&self, priority: Priority, task: Task) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            warn!(pool = %self.shared.config.name, "Dropping task submitted after shutdown");
            return;
        }
        state.queue.push(priority, task);

        if state.queue.len() > state.idle && state.workers < self.shared.config.max_workers {
            Self::spawn_worker(&self.shared, &mut state);
        } else {
            self.shared.work_available.notify_one();
        }
    }

    fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) {
        state.reap();

        let id = state.next_worker_id;
        let worker_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", shared.config.name, id))
            .spawn(move || Self::run(worker_shared));

        match spawned {
            Ok(handle) => {
                state.next_worker_id += 1;
                state.workers += 1;
                state.handles.push(handle);
            }
            // Queued work is still picked up by existing workers.
            Err(e) => error!(pool = %shared.config.name, error = %e, "Failed to spawn worker thread"),
        }
    }

    /// Main worker loop.
    ///
    /// Workers pull tasks until the pool shuts down. Non-core workers exit
    /// after `keep_alive` without work. A panicking task takes its worker down
    /// with it; the panic is raised again by [`WorkerPool::shutdown`].
    fn run(shared: Arc<Shared>) {
        let _exit = WorkerExit {
            shared: shared.clone(),
        };
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.shutdown {
                break;
            }

            if let Some(task) = state.queue.pop() {
                drop(state);
                task();
                state = shared.state.lock().unwrap();
                continue;
            }

            state.idle += 1;
            let (guard, timeout) = shared
                .work_available
                .wait_timeout(state, shared.config.keep_alive)
                .unwrap();
            state = guard;
            state.idle -= 1;

            if timeout.timed_out()
                && state.queue.is_empty()
                && state.workers > shared.config.core_workers
            {
                break;
            }
        }
    }

    /// Shutdown the worker pool.
    ///
    /// Queued tasks that have not started are dropped. Blocks until every
    /// worker has finished its current task, except when called from one of
    /// this pool's own workers.
    ///
    /// # Panics
    ///
    /// Resumes the first panic raised by a task on this pool.
    pub fn shutdown(&self) {
        let (handles, mut first_panic) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let dropped = state.queue.clear();
            if dropped > 0 {
                debug!(pool = %self.shared.config.name, dropped, "Dropped queued tasks on shutdown");
            }
            (std::mem::take(&mut state.handles), state.panic.take())
        };
        self.shared.work_available.notify_all();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if let Err(payload) = handle.join() {
                first_panic.get_or_insert(payload);
            }
        }

        if let Some(payload) = first_panic {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        self.submit(Priority::Normal, task);
    }

    fn execute_with_priority(&self, priority: Priority, task: Task) {
        self.submit(priority, task);
    }

    fn shutdown(&self) {
        WorkerPool::shutdown(self);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        state.queue.clear();
        drop(state);
        self.shared.work_available.notify_all();
    }
}

/// Keeps the pool's worker count right however the worker exits.
struct WorkerExit {
    shared: Arc<Shared>,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.workers -= 1;

        if thread::panicking() {
            error!(pool = %self.shared.config.name, "Task panicked, worker exiting");
            // Replace the worker so queued work still runs until shutdown.
            if !state.shutdown && !state.queue.is_empty() {
                WorkerPool::spawn_worker(&self.shared, &mut state);
            }
        }
    }
}

/// Get the number of logical CPU cores.
pub fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
