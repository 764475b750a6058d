//! Typed publish/subscribe between the manager and its consumers.
//!
//! Listeners are registered per [`EventKind`] and receive events
//! synchronously, in publish order. Each registration returns a
//! [`CallbackHandle`] that removes the listener when unregistered or
//! dropped. Consumers that prefer a channel can use [`EventBus::subscribe`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ble::permissions::Permission;
use crate::ble::transport::AdapterState;
use crate::protocol::DecodedMessage;

/// Event names listeners can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Connection state changed.
    ConnectionState,
    /// A frame was decoded by the protocol codec.
    DataReceived,
    /// A frame arrived (raw bytes, emitted even when decoding fails).
    RawDataReceived,
    /// The adapter reported a new state.
    AdapterState,
    /// Initialization was refused one or more permissions.
    PermissionsDenied,
}

/// Events published by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    /// `true` once a session is fully set up, `false` whenever it is lost.
    ConnectionState(bool),
    /// Decoded protocol message.
    DataReceived(DecodedMessage),
    /// Raw frame bytes.
    RawDataReceived(Vec<u8>),
    /// Adapter state.
    AdapterState(AdapterState),
    /// Permissions the user refused.
    PermissionsDenied(Vec<Permission>),
}

impl BleEvent {
    /// The kind this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionState(_) => EventKind::ConnectionState,
            Self::DataReceived(_) => EventKind::DataReceived,
            Self::RawDataReceived(_) => EventKind::RawDataReceived,
            Self::AdapterState(_) => EventKind::AdapterState,
            Self::PermissionsDenied(_) => EventKind::PermissionsDenied,
        }
    }
}

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&BleEvent) + Send + Sync>;
type ListenerMap = HashMap<EventKind, Vec<(ListenerId, Listener)>>;

/// Callback handle for unregistering listeners.
///
/// Dropping the handle unregisters the listener.
pub struct CallbackHandle {
    id: ListenerId,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: ListenerId, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this listener.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Keep the listener registered for the lifetime of the bus.
    pub fn detach(mut self) -> ListenerId {
        self.unregister_fn = None;
        self.id
    }

    /// Get the listener ID.
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Event bus shared by the manager components. Cloning shares the bus.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: Arc<AtomicU64>,
    event_tx: broadcast::Sender<BleEvent>,
}

impl EventBus {
    /// Create a bus whose channel subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            event_tx,
        }
    }

    /// Register a listener for one kind of event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> CallbackHandle
    where
        F: Fn(&BleEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));

        let listeners: Weak<RwLock<ListenerMap>> = Arc::downgrade(&self.listeners);
        CallbackHandle::new(id, move || {
            if let Some(listeners) = listeners.upgrade() {
                remove_listener(&listeners, kind, id);
            }
        })
    }

    /// Remove a listener. Removing an unknown or already removed listener
    /// is a no-op; returns whether something was removed.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        remove_listener(&self.listeners, kind, id)
    }

    /// Publish an event to the listeners of its kind and to channel subscribers.
    pub fn publish(&self, event: BleEvent) {
        let kind = event.kind();

        // Listeners may unregister themselves while being called.
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        trace!("Publishing {:?} to {} listener(s)", kind, targets.len());

        for listener in targets {
            listener(&event);
        }

        let _ = self.event_tx.send(event);
    }

    /// Receive every published event through a channel.
    pub fn subscribe(&self) -> broadcast::Receiver<BleEvent> {
        self.event_tx.subscribe()
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

fn remove_listener(listeners: &RwLock<ListenerMap>, kind: EventKind, id: ListenerId) -> bool {
    let mut listeners = listeners.write();
    let Some(entries) = listeners.get_mut(&kind) else {
        return false;
    };

    let before = entries.len();
    entries.retain(|(entry_id, _)| *entry_id != id);
    let removed = entries.len() != before;

    if entries.is_empty() {
        listeners.remove(&kind);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn recorder(bus: &EventBus, kind: EventKind) -> (Arc<Mutex<Vec<BleEvent>>>, CallbackHandle) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = bus.on(kind, move |event| sink.lock().push(event.clone()));
        (seen, handle)
    }

    #[test]
    fn test_multiple_listeners_per_kind() {
        let bus = EventBus::default();
        let (first, _h1) = recorder(&bus, EventKind::ConnectionState);
        let (second, _h2) = recorder(&bus, EventKind::ConnectionState);
        let (raw, _h3) = recorder(&bus, EventKind::RawDataReceived);

        bus.publish(BleEvent::ConnectionState(true));

        assert_eq!(*first.lock(), vec![BleEvent::ConnectionState(true)]);
        assert_eq!(*second.lock(), vec![BleEvent::ConnectionState(true)]);
        assert!(raw.lock().is_empty());
    }

    #[test]
    fn test_events_delivered_in_publish_order() {
        let bus = EventBus::default();
        let (seen, _handle) = recorder(&bus, EventKind::RawDataReceived);

        for i in 0..5u8 {
            bus.publish(BleEvent::RawDataReceived(vec![i]));
        }

        let order: Vec<_> = seen
            .lock()
            .iter()
            .map(|e| match e {
                BleEvent::RawDataReceived(bytes) => bytes[0],
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_removal_is_idempotent() {
        let bus = EventBus::default();
        let (seen, handle) = recorder(&bus, EventKind::ConnectionState);
        let id = handle.detach();

        assert!(bus.off(EventKind::ConnectionState, id));
        assert!(!bus.off(EventKind::ConnectionState, id));
        assert!(!bus.off(EventKind::DataReceived, id));

        bus.publish(BleEvent::ConnectionState(false));
        assert!(seen.lock().is_empty());
        assert_eq!(bus.listener_count(EventKind::ConnectionState), 0);
    }

    #[test]
    fn test_dropping_handle_unregisters() {
        let bus = EventBus::default();
        let (seen, handle) = recorder(&bus, EventKind::AdapterState);
        assert_eq!(bus.listener_count(EventKind::AdapterState), 1);

        drop(handle);
        bus.publish(BleEvent::AdapterState(AdapterState::PoweredOn));

        assert!(seen.lock().is_empty());
        assert_eq!(bus.listener_count(EventKind::AdapterState), 0);
    }

    #[test]
    fn test_handle_outliving_bus_is_harmless() {
        let bus = EventBus::default();
        let (_seen, handle) = recorder(&bus, EventKind::DataReceived);
        drop(bus);
        handle.unregister();
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let bus = EventBus::default();
        let slot: Arc<Mutex<Option<CallbackHandle>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicU64::new(0));

        let inner_slot = slot.clone();
        let inner_calls = calls.clone();
        let handle = bus.on(EventKind::ConnectionState, move |_| {
            inner_calls.fetch_add(1, Ordering::SeqCst);
            inner_slot.lock().take();
        });
        *slot.lock() = Some(handle);

        bus.publish(BleEvent::ConnectionState(true));
        bus.publish(BleEvent::ConnectionState(false));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_subscribers_receive_all_kinds() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(BleEvent::ConnectionState(true));
        bus.publish(BleEvent::RawDataReceived(vec![1, 2]));

        assert_eq!(rx.recv().await.unwrap(), BleEvent::ConnectionState(true));
        assert_eq!(rx.recv().await.unwrap(), BleEvent::RawDataReceived(vec![1, 2]));
    }
}
