//! Pixelflow Scheduler Library
//!
//! Execution contexts for the loading engine: priority-ordered worker pools,
//! an inline executor, the named pool set the engine places work on, and
//! cooperative cancellation tokens.
//!
//! # Example
//!
//! ```
//! use pixelflow_scheduler::{EnginePools, Executor, Priority};
//! use std::sync::mpsc;
//!
//! let pools = EnginePools::new(Some(2), None);
//! let (tx, rx) = mpsc::channel();
//!
//! // Decode work goes to a source pool, results are delivered on main.
//! let main = pools.main().clone();
//! pools.source_for(false, false).execute_with_priority(
//!     Priority::High,
//!     Box::new(move || {
//!         let decoded = 21 * 2;
//!         main.execute(Box::new(move || tx.send(decoded).unwrap()));
//!     }),
//! );
//!
//! assert_eq!(rx.recv().unwrap(), 42);
//! pools.shutdown();
//! ```

mod cancel;
mod executor;
mod priority;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use executor::{
    default_animation_threads, default_source_threads, DirectExecutor, EnginePools, Executor, Task,
};
pub use priority::{Priority, TaskQueue};
pub use worker::{num_cpus, WorkerPool, WorkerPoolConfig};
