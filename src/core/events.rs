//! Typed event dispatch
//!
//! Each entity owns an [`EventHub`] for its closed event enum. Listeners are
//! called synchronously in registration order; async consumers can also
//! subscribe to a broadcast channel that receives the same events afterwards.
//!
//! Code that raises events while holding a lock uses [`EventHub::prepare`]
//! and delivers the returned [`Dispatch`] after the lock is released, so
//! listeners are free to read the owner again.

use std::sync::Arc;
use tokio::sync::broadcast;

/// Handle returned by [`EventHub::listen`]
pub type ListenerId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// An event bound to the listeners registered when it was raised
#[must_use = "listeners only run once the dispatch is delivered"]
pub struct Dispatch<E: Clone> {
    event: E,
    listeners: Vec<Listener<E>>,
    tx: broadcast::Sender<E>,
}

impl<E: Clone> Dispatch<E> {
    /// The event being dispatched
    pub fn event(&self) -> &E {
        &self.event
    }

    /// Call every listener in registration order, then broadcast
    pub fn deliver(self) {
        for listener in &self.listeners {
            listener(&self.event);
        }
        // No subscribers is not an error
        let _ = self.tx.send(self.event);
    }
}

impl<E: Clone + std::fmt::Debug> std::fmt::Debug for Dispatch<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("event", &self.event)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Synchronous listener list plus broadcast fan-out
pub struct EventHub<E: Clone> {
    listeners: Vec<(ListenerId, Listener<E>)>,
    next_id: ListenerId,
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventHub<E> {
    /// Create a hub whose broadcast channel buffers `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Vec::new(),
            next_id: 0,
            tx,
        }
    }

    /// Register a listener
    pub fn listen<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unlisten(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Subscribe to the broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Bind an event to the current listeners without calling them
    pub fn prepare(&self, event: E) -> Dispatch<E> {
        Dispatch {
            event,
            listeners: self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            tx: self.tx.clone(),
        }
    }

    /// Dispatch an event to every listener, then to broadcast subscribers
    pub fn emit(&self, event: E) {
        self.prepare(event).deliver();
    }
}

impl<E: Clone> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listeners.len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = EventHub::<u32>::new(8);

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            hub.listen(move |event| log.lock().push(format!("{}:{}", tag, event)));
        }
        hub.emit(7);

        assert_eq!(*log.lock(), vec!["first:7", "second:7", "third:7"]);
    }

    #[test]
    fn test_unlisten() {
        let count = Arc::new(Mutex::new(0));
        let mut hub = EventHub::<()>::new(8);
        let c = count.clone();
        let id = hub.listen(move |_| *c.lock() += 1);

        hub.emit(());
        assert!(hub.unlisten(id));
        assert!(!hub.unlisten(id));
        hub.emit(());

        assert_eq!(*count.lock(), 1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_prepared_dispatch_runs_on_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hub = EventHub::<u32>::new(8);
        let mut rx = hub.subscribe();
        let l = log.clone();
        hub.listen(move |event| l.lock().push(*event));

        let dispatch = hub.prepare(3);
        // Listeners added after the event was raised do not see it
        let l = log.clone();
        hub.listen(move |event| l.lock().push(*event + 100));
        assert!(log.lock().is_empty());
        assert!(rx.try_recv().is_err());

        dispatch.deliver();
        assert_eq!(*log.lock(), vec![3]);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_broadcast_subscribers_receive_events() {
        let hub = EventHub::<&'static str>::new(8);
        let mut rx = hub.subscribe();
        hub.emit("opened");
        assert_eq!(rx.try_recv().unwrap(), "opened");
    }
}
