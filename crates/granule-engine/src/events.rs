//! Endpoint message events
//!
//! An observer registry for the `Sending*` / `Receiving*` hooks. Observers
//! run synchronously under the executor context; they may inspect messages
//! but must not mutate them in ways that change wire output.

use granule_core::Message;
use parking_lot::RwLock;
use std::sync::Arc;

/// Callbacks fired around the endpoint's send and receive paths
#[allow(unused_variables)]
pub trait EndpointObserver: Send + Sync {
    fn sending_request(&self, request: &Message) {}
    fn sending_response(&self, response: &Message) {}
    fn sending_empty(&self, message: &Message) {}
    fn receiving_request(&self, request: &Message) {}
    fn receiving_response(&self, response: &Message) {}
    fn receiving_empty(&self, message: &Message) {}
}

/// Which hook to fire
#[derive(Debug, Clone, Copy)]
pub(crate) enum Event {
    SendingRequest,
    SendingResponse,
    SendingEmpty,
    ReceivingRequest,
    ReceivingResponse,
    ReceivingEmpty,
}

/// Registered observers, invoked in registration order
#[derive(Default)]
pub struct EventRegistry {
    observers: RwLock<Vec<Arc<dyn EndpointObserver>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn EndpointObserver>) {
        self.observers.write().push(observer);
    }

    pub(crate) fn notify(&self, event: Event, message: &Message) {
        for observer in self.observers.read().iter() {
            match event {
                Event::SendingRequest => observer.sending_request(message),
                Event::SendingResponse => observer.sending_response(message),
                Event::SendingEmpty => observer.sending_empty(message),
                Event::ReceivingRequest => observer.receiving_request(message),
                Event::ReceivingResponse => observer.receiving_response(message),
                Event::ReceivingEmpty => observer.receiving_empty(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_core::Code;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        sent: AtomicUsize,
        received: AtomicUsize,
    }

    impl EndpointObserver for Counter {
        fn sending_request(&self, _request: &Message) {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        fn receiving_response(&self, _response: &Message) {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_notify_dispatch() {
        let registry = EventRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.add(counter.clone());

        let msg = Message::request(Code::GET, true);
        registry.notify(Event::SendingRequest, &msg);
        registry.notify(Event::ReceivingResponse, &msg);
        registry.notify(Event::SendingEmpty, &msg);

        assert_eq!(counter.sent.load(Ordering::Relaxed), 1);
        assert_eq!(counter.received.load(Ordering::Relaxed), 1);
    }
}
