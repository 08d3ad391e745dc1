//! Keyed resources
//!
//! A decoded payload implements [`Resource`]. The engine hands payloads to
//! consumers wrapped in an [`EngineResource`]: a reference counted handle that
//! knows the key it was loaded for, whether it may be kept in memory and
//! whether the engine is responsible for recycling the payload.
//!
//! The logical count (`acquire`/`release`) is separate from the number of
//! `EngineResource` clones. When the count drops back to zero the owning
//! listener decides what happens next: cache it or recycle it. Recycling
//! happens exactly once and only while nobody holds an acquisition.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, Weak};

use pixelflow_cache::Weighted;
use tracing::trace;

use crate::active::ActiveMessage;
use crate::key::EngineKey;

/// A decoded payload.
pub trait Resource: Any + Send + Sync {
    /// Estimated size in bytes, used to budget the memory cache.
    fn size(&self) -> usize;

    /// Give back whatever the payload holds, e.g. return buffers to a pool.
    ///
    /// Called at most once by the engine, after every consumer is done.
    fn recycle(&self) {}

    fn as_any(&self) -> &dyn Any;
}

impl dyn Resource {
    /// Borrow the payload as its concrete type.
    pub fn downcast_ref<T: Resource>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Notified when an [`EngineResource`] is no longer acquired by anyone.
pub trait ResourceListener: Send + Sync {
    fn on_resource_released(&self, key: &EngineKey, resource: EngineResource);
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct RefState {
    acquired: usize,
    is_recycled: bool,
    /// The last drop to zero was handled by the listener.
    is_settled: bool,
}

struct Inner {
    id: u64,
    key: EngineKey,
    resource: Arc<dyn Resource>,
    is_memory_cacheable: bool,
    is_recyclable: bool,
    listener: Option<Weak<dyn ResourceListener>>,
    state: Mutex<RefState>,
    /// Armed by the active registry; fires when the last handle is dropped.
    watcher: Mutex<Option<Sender<ActiveMessage>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().map(Option::take).unwrap_or(None);
        if let Some(watcher) = watcher {
            // The registry may already be shut down; nothing left to notify then.
            let _ = watcher.send(ActiveMessage::Reclaimed {
                id: self.id,
                key: self.key.clone(),
            });
        }
    }
}

/// Reference counted handle to a decoded payload.
///
/// Clones refer to the same handle; equality is identity.
#[derive(Clone)]
pub struct EngineResource {
    inner: Arc<Inner>,
}

impl EngineResource {
    pub fn new(
        resource: Arc<dyn Resource>,
        is_memory_cacheable: bool,
        is_recyclable: bool,
        key: EngineKey,
        listener: Option<Weak<dyn ResourceListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                key,
                resource,
                is_memory_cacheable,
                is_recyclable,
                listener,
                state: Mutex::new(RefState::default()),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Unique identity of this handle.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn key(&self) -> &EngineKey {
        &self.inner.key
    }

    /// The wrapped payload.
    pub fn resource(&self) -> &Arc<dyn Resource> {
        &self.inner.resource
    }

    pub fn size(&self) -> usize {
        self.inner.resource.size()
    }

    pub fn is_memory_cacheable(&self) -> bool {
        self.inner.is_memory_cacheable
    }

    pub fn is_recyclable(&self) -> bool {
        self.inner.is_recyclable
    }

    /// Number of outstanding acquisitions.
    pub fn acquired(&self) -> usize {
        self.inner.state.lock().unwrap().acquired
    }

    pub fn is_recycled(&self) -> bool {
        self.inner.state.lock().unwrap().is_recycled
    }

    /// Record one more consumer.
    ///
    /// # Panics
    ///
    /// Panics if the payload has already been recycled.
    pub fn acquire(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_recycled {
            panic!("Cannot acquire a recycled resource: {}", self.inner.key);
        }
        state.acquired += 1;
        state.is_settled = false;
    }

    /// Record that one consumer is done. The listener is told when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn release(&self) {
        let released = {
            let mut state = self.inner.state.lock().unwrap();
            if state.acquired == 0 {
                panic!(
                    "Cannot release a recycled or not yet acquired resource: {}",
                    self.inner.key
                );
            }
            state.acquired -= 1;
            state.acquired == 0
        };

        if released {
            trace!(key = %self.inner.key, id = self.inner.id, "Resource released");
            if let Some(listener) = self.inner.listener.as_ref().and_then(Weak::upgrade) {
                listener.on_resource_released(&self.inner.key, self.clone());
            }
        }
    }

    /// Recycle the payload. The payload's own `recycle` only runs if this handle is recyclable.
    ///
    /// # Panics
    ///
    /// Panics if the resource is still acquired or was already recycled.
    pub fn recycle(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.acquired > 0 {
                panic!(
                    "Cannot recycle a resource while it is still acquired: {}",
                    self.inner.key
                );
            }
            if state.is_recycled {
                panic!(
                    "Cannot recycle a resource that has already been recycled: {}",
                    self.inner.key
                );
            }
            state.is_recycled = true;
        }
        trace!(key = %self.inner.key, id = self.inner.id, "Recycling resource");
        if self.inner.is_recyclable {
            self.inner.resource.recycle();
        }
    }

    /// Claim the handling of the latest drop of the count to zero.
    ///
    /// Returns false if the resource was acquired again since, or if another
    /// release notification already claimed it.
    pub(crate) fn settle_release(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.acquired > 0 || state.is_settled {
            return false;
        }
        state.is_settled = true;
        true
    }

    pub(crate) fn downgrade(&self) -> WeakEngineResource {
        WeakEngineResource {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Arm the drop notification consumed by the active registry.
    pub(crate) fn watch(&self, watcher: Sender<ActiveMessage>) {
        *self.inner.watcher.lock().unwrap() = Some(watcher);
    }

    pub(crate) fn unwatch(&self) {
        self.inner.watcher.lock().unwrap().take();
    }
}

impl PartialEq for EngineResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EngineResource {}

impl Weighted for EngineResource {
    fn weight(&self) -> usize {
        self.size()
    }
}

impl fmt::Debug for EngineResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("EngineResource")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("size", &self.size())
            .field("is_memory_cacheable", &self.inner.is_memory_cacheable)
            .field("is_recyclable", &self.inner.is_recyclable)
            .field("acquired", &state.acquired)
            .field("is_recycled", &state.is_recycled)
            .finish()
    }
}

/// Non-owning reference used by the active registry.
#[derive(Clone)]
pub(crate) struct WeakEngineResource {
    inner: Weak<Inner>,
}

impl WeakEngineResource {
    pub(crate) fn upgrade(&self) -> Option<EngineResource> {
        self.inner.upgrade().map(|inner| EngineResource { inner })
    }
}

/// A payload holding raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesResource {
    bytes: Arc<[u8]>,
}

impl BytesResource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Resource for BytesResource {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
