//! Resource recycler
//!
//! Recycling a payload can release other resources it holds, which can evict
//! from the memory cache, which asks for another recycle. Such nested
//! requests are posted to the main executor instead of recursing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pixelflow_scheduler::Executor;
use tracing::trace;

use crate::resource::EngineResource;

/// Recycles resources the engine no longer needs.
pub struct ResourceRecycler {
    is_recycling: AtomicBool,
    main: Arc<dyn Executor>,
}

impl ResourceRecycler {
    pub fn new(main: Arc<dyn Executor>) -> Self {
        Self {
            is_recycling: AtomicBool::new(false),
            main,
        }
    }

    /// Recycle `resource` now, or on the main executor if a recycle is
    /// already running or `force_next_frame` is set.
    pub fn recycle(&self, resource: EngineResource, force_next_frame: bool) {
        if force_next_frame || self.is_recycling.swap(true, Ordering::AcqRel) {
            trace!(key = %resource.key(), "Posting recycle to main executor");
            self.main.execute(Box::new(move || resource.recycle()));
            return;
        }

        resource.recycle();
        self.is_recycling.store(false, Ordering::Release);
    }
}
