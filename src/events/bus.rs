//! Per-node event bus.
//!
//! Mutations enqueue events here after they are applied; a dedicated
//! dispatch thread hands them to listeners so a slow or panicking listener
//! never stalls the mutating caller or the replication worker.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::{CacheEvent, EventType};
use crate::cluster::NodeId;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId(u64);

/// Listener callback. Returning `false` unsubscribes the listener.
pub type ListenerFn = Arc<dyn Fn(&CacheEvent) -> bool + Send + Sync>;

struct Listener {
    callback: ListenerFn,
    types: HashSet<EventType>,
}

type Registry = Arc<RwLock<HashMap<ListenerId, Listener>>>;

pub struct EventBus {
    node: NodeId,
    listeners: Registry,
    queue: Mutex<Option<UnboundedSender<CacheEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates the bus and starts its dispatch thread.
    pub fn new(node: NodeId) -> Self {
        let listeners: Registry = Arc::default();
        let (tx, rx) = unbounded_channel();
        let registry = Arc::clone(&listeners);
        let dispatcher = thread::Builder::new()
            .name(format!("mesh-cache-events-{}", node.0))
            .spawn(move || dispatch_loop(node, rx, registry))
            .map_err(|err| warn!(%node, "event dispatcher failed to start: {}", err))
            .ok();

        Self {
            node,
            listeners,
            queue: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(dispatcher),
            next_id: AtomicU64::new(1),
        }
    }

    // == Subscribe ==
    /// Registers `callback` for the given event types.
    pub fn subscribe<F>(&self, callback: F, types: &[EventType]) -> ListenerId
    where
        F: Fn(&CacheEvent) -> bool + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Listener {
            callback: Arc::new(callback),
            types: types.iter().copied().collect(),
        };
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        debug!(node = %self.node, listener = id.0, ?types, "listener subscribed");
        id
    }

    // == Unsubscribe ==
    /// Removes a listener; returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queues events for dispatch, preserving their order.
    pub(crate) fn publish(&self, events: Vec<CacheEvent>) {
        if events.is_empty() {
            return;
        }
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = queue.as_ref() {
            for event in events {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    }

    /// Stops accepting events and waits for queued ones to be delivered.
    pub fn shutdown(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(node = %self.node, "event dispatcher exited abnormally");
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("node", &self.node)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn dispatch_loop(node: NodeId, mut rx: UnboundedReceiver<CacheEvent>, listeners: Registry) {
    while let Some(event) = rx.blocking_recv() {
        let targets: Vec<(ListenerId, ListenerFn)> = listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, l)| l.types.contains(&event.event_type))
            .map(|(id, l)| (*id, Arc::clone(&l.callback)))
            .collect();

        for (id, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(true) => {}
                Ok(false) => {
                    listeners
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    debug!(%node, listener = id.0, "listener unsubscribed itself");
                }
                Err(_) => {
                    warn!(%node, listener = id.0, %event, "event listener panicked");
                }
            }
        }
    }
    debug!(%node, "event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Version;
    use std::sync::mpsc;
    use std::time::Duration;

    fn event(event_type: EventType, key: &str) -> CacheEvent {
        CacheEvent::new(
            event_type,
            key,
            Some("v".to_string()),
            Version::new(1, NodeId(0)),
            NodeId(0),
        )
    }

    #[test]
    fn test_listener_receives_matching_types_only() {
        let bus = EventBus::new(NodeId(0));
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |e| {
                tx.send(e.event_type).unwrap();
                true
            },
            &[EventType::Removed],
        );

        bus.publish(vec![
            event(EventType::Put, "a"),
            event(EventType::Removed, "a"),
        ]);

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            EventType::Removed
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new(NodeId(0));
        bus.subscribe(|_| panic!("listener failure"), &EventType::MUTATIONS);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |e| {
                tx.send(e.key.clone()).unwrap();
                true
            },
            &EventType::MUTATIONS,
        );

        bus.publish(vec![event(EventType::Put, "a"), event(EventType::Put, "b")]);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "b");
    }

    #[test]
    fn test_listener_returning_false_unsubscribes() {
        let bus = EventBus::new(NodeId(0));
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |e| {
                tx.send(e.key.clone()).unwrap();
                false
            },
            &EventType::MUTATIONS,
        );

        bus.publish(vec![event(EventType::Put, "a"), event(EventType::Put, "b")]);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "a");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        bus.shutdown();
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new(NodeId(0));
        let id = bus.subscribe(|_| true, &EventType::MUTATIONS);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_shutdown_delivers_queued_events_then_drops_new_ones() {
        let bus = EventBus::new(NodeId(0));
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            move |e| {
                std::thread::sleep(Duration::from_millis(5));
                tx.send(e.key.clone()).is_ok()
            },
            &EventType::MUTATIONS,
        );

        let keys: Vec<String> = (0..20).map(|i| format!("k{}", i)).collect();
        bus.publish(keys.iter().map(|k| event(EventType::Put, k)).collect());
        bus.shutdown();
        bus.publish(vec![event(EventType::Put, "late")]);

        let delivered: Vec<String> = rx.try_iter().collect();
        assert_eq!(delivered, keys);
    }
}
