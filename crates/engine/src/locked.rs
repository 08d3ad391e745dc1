//! Locked resources
//!
//! While a freshly decoded resource is being written to the resource disk
//! cache it may already have been delivered, used and released by every
//! consumer. Wrapping it in a [`LockedResource`] defers the payload's recycle
//! until the writer unlocks it.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::resource::Resource;

#[derive(Debug)]
struct LockState {
    is_locked: bool,
    is_recycled: bool,
}

/// A payload whose recycle is deferred until [`LockedResource::unlock`].
pub struct LockedResource {
    resource: Arc<dyn Resource>,
    state: Mutex<LockState>,
}

impl LockedResource {
    /// Wrap `resource` in the locked state.
    pub fn obtain(resource: Arc<dyn Resource>) -> Arc<Self> {
        Arc::new(Self {
            resource,
            state: Mutex::new(LockState {
                is_locked: true,
                is_recycled: false,
            }),
        })
    }

    /// The wrapped payload.
    pub fn inner(&self) -> &Arc<dyn Resource> {
        &self.resource
    }

    /// Allow recycling again, running a recycle that was requested while locked.
    ///
    /// # Panics
    ///
    /// Panics if the resource is not locked.
    pub fn unlock(&self) {
        let recycle_now = {
            let mut state = self.state.lock().unwrap();
            if !state.is_locked {
                panic!("Already unlocked");
            }
            state.is_locked = false;
            state.is_recycled
        };
        if recycle_now {
            self.resource.recycle();
        }
    }
}

impl Resource for LockedResource {
    fn size(&self) -> usize {
        self.resource.size()
    }

    fn recycle(&self) {
        let recycle_now = {
            let mut state = self.state.lock().unwrap();
            state.is_recycled = true;
            !state.is_locked
        };
        if recycle_now {
            self.resource.recycle();
        }
    }

    /// Consumers see through the lock to the wrapped payload.
    fn as_any(&self) -> &dyn Any {
        self.resource.as_any()
    }
}
