//! Active resources
//!
//! Tracks resources that consumers currently hold, independently of the
//! memory cache. Entries are weak: the registry never keeps a resource alive.
//!
//! Normally a resource leaves the registry when its acquisition count drops to
//! zero and the engine deactivates it. A consumer may also drop its handles
//! without releasing them. Dropping the last handle sends a notification to a
//! watcher thread, which removes the stale entry and, when the registry is
//! configured to retain payloads, hands the payload back to the engine in a
//! fresh non-recyclable wrapper so it can still land in the memory cache.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::key::EngineKey;
use crate::resource::{EngineResource, Resource, ResourceListener, WeakEngineResource};

/// Messages consumed by the watcher thread.
pub(crate) enum ActiveMessage {
    /// The last handle of the resource with this id was dropped.
    Reclaimed { id: u64, key: EngineKey },
    /// `get` found this entry dead before its reclamation arrived.
    Stale { key: EngineKey, entry: ActiveEntry },
    Shutdown,
}

/// Called after the watcher processed a reclamation.
pub type ReclaimObserver = Box<dyn Fn(&EngineKey) + Send + Sync>;

pub(crate) struct ActiveEntry {
    id: u64,
    resource: WeakEngineResource,
    is_cacheable: bool,
    /// Payload kept reachable for the hand-off, only in retain mode.
    retained: Option<Arc<dyn Resource>>,
}

struct Shared {
    entries: Mutex<HashMap<EngineKey, ActiveEntry>>,
    listener: Mutex<Option<Weak<dyn ResourceListener>>>,
    observer: Mutex<Option<ReclaimObserver>>,
    retain_cleared_payload: bool,
}

impl Shared {
    /// Remove `entry`'s leftovers and hand a retained payload to the listener.
    fn cleanup(&self, key: &EngineKey, entry: ActiveEntry) {
        if !entry.is_cacheable {
            return;
        }
        let Some(payload) = entry.retained else {
            return;
        };

        let listener = self.listener.lock().unwrap().clone();
        let Some(listener) = listener.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        debug!(key = %key, "Handing retained payload of a reclaimed resource to the memory cache");
        let wrapper = EngineResource::new(
            payload,
            true,
            false,
            key.clone(),
            Some(Arc::downgrade(&listener)),
        );
        listener.on_resource_released(key, wrapper);
    }

    fn on_reclaimed(&self, id: u64, key: &EngineKey) {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some(entry) if entry.id == id => entries.remove(key),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            trace!(key = %key, id, "Active resource reclaimed");
            self.cleanup(key, entry);
        }

        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            observer(key);
        }
    }
}

/// Weak registry of resources currently in use.
pub struct ActiveResources {
    shared: Arc<Shared>,
    sender: Sender<ActiveMessage>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveResources {
    /// Create the registry and start its watcher thread.
    pub fn new(retain_cleared_payload: bool) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            observer: Mutex::new(None),
            retain_cleared_payload,
        });
        let (sender, receiver) = mpsc::channel();

        let watcher_shared = shared.clone();
        let watcher = thread::Builder::new()
            .name("pixelflow-active-resources".into())
            .spawn(move || watch(watcher_shared, receiver));
        let watcher = match watcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Stale entries are still removed lazily by `get`.
                warn!(error = %e, "Failed to spawn active resource watcher");
                None
            }
        };

        Self {
            shared,
            sender,
            watcher: Mutex::new(watcher),
        }
    }

    /// Listener receiving retained payloads of reclaimed resources.
    pub fn set_listener(&self, listener: Weak<dyn ResourceListener>) {
        *self.shared.listener.lock().unwrap() = Some(listener);
    }

    /// Observe every reclamation processed by the watcher.
    pub fn set_reclaim_observer(&self, observer: ReclaimObserver) {
        *self.shared.observer.lock().unwrap() = Some(observer);
    }

    /// Track `resource` under `key`, replacing any previous entry.
    pub fn activate(&self, key: EngineKey, resource: &EngineResource) {
        let is_cacheable = resource.is_memory_cacheable();
        let entry = ActiveEntry {
            id: resource.id(),
            resource: resource.downgrade(),
            is_cacheable,
            retained: (is_cacheable && self.shared.retain_cleared_payload)
                .then(|| resource.resource().clone()),
        };
        resource.watch(self.sender.clone());

        let previous = self.shared.entries.lock().unwrap().insert(key, entry);
        if let Some(previous) = previous.filter(|previous| previous.id != resource.id()) {
            disarm(previous);
        }
    }

    /// Stop tracking `key`.
    pub fn deactivate(&self, key: &EngineKey) {
        let removed = self.shared.entries.lock().unwrap().remove(key);
        if let Some(removed) = removed {
            disarm(removed);
        }
    }

    /// The live resource for `key`, if any.
    ///
    /// A stale entry is removed and its hand-off runs on the watcher thread,
    /// so callers may hold locks the listener needs.
    pub fn get(&self, key: &EngineKey) -> Option<EngineResource> {
        let stale = {
            let mut entries = self.shared.entries.lock().unwrap();
            let entry = entries.get(key)?;
            if let Some(resource) = entry.resource.upgrade() {
                return Some(resource);
            }
            entries.remove(key)
        };

        if let Some(entry) = stale {
            trace!(key = %key, id = entry.id, "Removed stale active resource");
            // Without a watcher the retained payload is simply dropped.
            let _ = self.sender.send(ActiveMessage::Stale {
                key: key.clone(),
                entry,
            });
        }
        None
    }

    /// Returns true if `resource` is the one tracked under `key`.
    pub fn is_tracking(&self, key: &EngineKey, resource: &EngineResource) -> bool {
        self.shared
            .entries
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|entry| entry.id == resource.id())
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the watcher thread.
    pub fn shutdown(&self) {
        let handle = self.watcher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(ActiveMessage::Shutdown);
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ActiveResources {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Stop a replaced or deactivated entry from reporting its drop.
fn disarm(entry: ActiveEntry) {
    if let Some(resource) = entry.resource.upgrade() {
        resource.unwatch();
    }
}

fn watch(shared: Arc<Shared>, receiver: Receiver<ActiveMessage>) {
    debug!("Active resource watcher started");
    while let Ok(message) = receiver.recv() {
        match message {
            ActiveMessage::Reclaimed { id, key } => shared.on_reclaimed(id, &key),
            ActiveMessage::Stale { key, entry } => shared.cleanup(&key, entry),
            ActiveMessage::Shutdown => break,
        }
    }
    debug!("Active resource watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::{test_key, CountingResource};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Released {
        resources: Mutex<Vec<EngineResource>>,
    }

    impl ResourceListener for Released {
        fn on_resource_released(&self, _key: &EngineKey, resource: EngineResource) {
            self.resources.lock().unwrap().push(resource);
        }
    }

    fn resource(size: usize, cacheable: bool) -> (EngineResource, Arc<CountingResource>) {
        let payload = CountingResource::with_size(size);
        (
            EngineResource::new(payload.clone(), cacheable, true, test_key("a"), None),
            payload,
        )
    }

    fn registry_with_listener(retain: bool) -> (ActiveResources, Arc<Released>) {
        let active = ActiveResources::new(retain);
        let listener = Arc::new(Released::default());
        let weak: Weak<dyn ResourceListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn ResourceListener>));
        active.set_listener(weak);
        (active, listener)
    }

    fn observe(active: &ActiveResources) -> Receiver<EngineKey> {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        active.set_reclaim_observer(Box::new(move |key| {
            let _ = tx.lock().unwrap().send(key.clone());
        }));
        rx
    }

    #[test]
    fn test_get_returns_activated_resource() {
        let active = ActiveResources::new(false);
        let (resource, _) = resource(10, true);
        active.activate(test_key("a"), &resource);

        assert_eq!(active.get(&test_key("a")), Some(resource.clone()));
        assert!(active.is_tracking(&test_key("a"), &resource));
        assert!(active.get(&test_key("b")).is_none());
    }

    #[test]
    fn test_deactivate_removes_entry() {
        let active = ActiveResources::new(false);
        let (resource, _) = resource(10, true);
        active.activate(test_key("a"), &resource);
        active.deactivate(&test_key("a"));

        assert!(active.get(&test_key("a")).is_none());
        assert!(active.is_empty());
    }

    #[test]
    fn test_activate_replaces_previous_entry() {
        let active = ActiveResources::new(false);
        let rx = observe(&active);
        let (first, _) = resource(10, true);
        let (second, _) = resource(10, true);

        active.activate(test_key("a"), &first);
        active.activate(test_key("a"), &second);
        assert_eq!(active.get(&test_key("a")), Some(second.clone()));
        assert!(!active.is_tracking(&test_key("a"), &first));

        // The replaced entry was disarmed, so dropping it reports nothing.
        drop(first);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_dropping_last_handle_removes_entry() {
        let active = ActiveResources::new(false);
        let rx = observe(&active);
        let (resource, payload) = resource(10, true);
        active.activate(test_key("a"), &resource);

        drop(resource);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), test_key("a"));
        assert!(active.is_empty());
        assert_eq!(payload.recycle_count(), 0);
    }

    #[test]
    fn test_get_cleans_up_stale_entry() {
        let active = ActiveResources::new(false);
        active.shutdown();
        let (resource, _) = resource(10, true);
        active.activate(test_key("a"), &resource);
        drop(resource);

        assert_eq!(active.len(), 1);
        assert!(active.get(&test_key("a")).is_none());
        assert!(active.is_empty());
    }

    /// Records the thread each hand-off arrived on.
    #[derive(Default)]
    struct HandOffThreads {
        names: Mutex<Vec<Option<String>>>,
    }

    impl ResourceListener for HandOffThreads {
        fn on_resource_released(&self, _key: &EngineKey, _resource: EngineResource) {
            let name = thread::current().name().map(str::to_owned);
            self.names.lock().unwrap().push(name);
        }
    }

    #[test]
    fn test_stale_entry_from_get_handed_off_on_watcher_thread() {
        let active = ActiveResources::new(true);
        let listener = Arc::new(HandOffThreads::default());
        let weak: Weak<dyn ResourceListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn ResourceListener>));
        active.set_listener(weak);

        let (resource, _) = resource(10, true);
        active.activate(test_key("a"), &resource);
        // Only `get` can notice the entry went stale.
        resource.unwatch();
        drop(resource);

        assert!(active.get(&test_key("a")).is_none());
        assert!(active.is_empty());

        let mut waited = Duration::ZERO;
        while listener.names.lock().unwrap().is_empty() && waited < TIMEOUT {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        assert_eq!(
            *listener.names.lock().unwrap(),
            vec![Some("pixelflow-active-resources".to_string())]
        );
    }

    #[test]
    fn test_retained_payload_handed_off_in_new_non_recyclable_wrapper() {
        let (active, listener) = registry_with_listener(true);
        let rx = observe(&active);
        let (resource, payload) = resource(10, true);
        let original_id = resource.id();
        active.activate(test_key("a"), &resource);

        drop(resource);
        rx.recv_timeout(TIMEOUT).unwrap();

        let handed_off = listener.resources.lock().unwrap().pop().unwrap();
        assert_ne!(handed_off.id(), original_id);
        assert!(handed_off.is_memory_cacheable());
        assert!(!handed_off.is_recyclable());
        assert_eq!(handed_off.size(), 10);

        // The new owner may present the payload but never disposes of it.
        handed_off.recycle();
        assert_eq!(payload.recycle_count(), 0);
    }

    #[test]
    fn test_no_hand_off_without_retain_mode() {
        let (active, listener) = registry_with_listener(false);
        let rx = observe(&active);
        let (resource, _) = resource(10, true);
        active.activate(test_key("a"), &resource);

        drop(resource);
        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(listener.resources.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_hand_off_for_uncacheable_resource() {
        let (active, listener) = registry_with_listener(true);
        let rx = observe(&active);
        let (resource, _) = resource(10, false);
        active.activate(test_key("a"), &resource);

        drop(resource);
        rx.recv_timeout(TIMEOUT).unwrap();
        assert!(listener.resources.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stale_notification_ignored_after_reactivation() {
        let active = ActiveResources::new(false);
        let (first, _) = resource(10, true);
        let (second, _) = resource(10, true);
        active.activate(test_key("a"), &first);
        let first_id = first.id();
        active.activate(test_key("a"), &second);

        active.shared.on_reclaimed(first_id, &test_key("a"));
        assert_eq!(active.get(&test_key("a")), Some(second));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let active = ActiveResources::new(false);
        active.shutdown();
        active.shutdown();
    }
}
