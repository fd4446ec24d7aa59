//! Observe relations (RFC 7641), server side
//!
//! A relation is an edge between a remote observer and a resource,
//! created by GET with Observe=0 against an observable resource. It ends
//! on GET with Observe=1 bearing the same token, on an RST from the
//! observer, or when a confirmable notification exhausts its retransmits.
//! Relations from one peer are grouped under an `ObservingEndpoint` so a
//! dead peer tears down everything at once.

use dashmap::DashMap;
use granule_core::{Code, Message, MessageType, Token};
use granule_engine::{Endpoint, Exchange};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

use crate::resource::Resource;

/// One remote observer of one resource
pub struct ObserveRelation {
    resource: Weak<Resource>,
    exchange: Arc<Exchange>,
    endpoint: Endpoint,
    source: SocketAddr,
    token: Token,
    sequence: AtomicU32,
    canceled: AtomicBool,
    /// Notifications since the last confirmable freshness probe
    since_probe: AtomicU32,
    last_probe: Mutex<Instant>,
}

impl ObserveRelation {
    pub fn new(
        resource: &Arc<Resource>,
        exchange: Arc<Exchange>,
        endpoint: Endpoint,
        source: SocketAddr,
        token: Token,
    ) -> Arc<Self> {
        Arc::new(ObserveRelation {
            resource: Arc::downgrade(resource),
            exchange,
            endpoint,
            source,
            token,
            sequence: AtomicU32::new(1),
            canceled: AtomicBool::new(false),
            since_probe: AtomicU32::new(0),
            last_probe: Mutex::new(Instant::now()),
        })
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Every n-th notification (or after enough wall time) goes out CON
    /// so a vanished observer is eventually noticed
    fn probe_due(&self) -> bool {
        let config = self.endpoint.config();
        let count = self.since_probe.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= config.notification_check_interval_count {
            self.since_probe.store(0, Ordering::Relaxed);
            *self.last_probe.lock() = Instant::now();
            return true;
        }
        let mut last = self.last_probe.lock();
        if last.elapsed() >= config.notification_check_interval_time {
            self.since_probe.store(0, Ordering::Relaxed);
            *last = Instant::now();
            return true;
        }
        false
    }

    /// Build and send one notification by re-running the resource's GET
    /// handler. Failure of a CON notification cancels the relation via
    /// the exchange failure path.
    pub(crate) fn notify(self: &Arc<Self>) {
        if self.is_canceled() {
            return;
        }
        let resource = match self.resource.upgrade() {
            Some(resource) => resource,
            None => {
                self.cancel();
                return;
            }
        };
        let handler = match resource.method_handler(Code::GET) {
            Some(handler) => handler,
            None => return,
        };
        let request = match self.exchange.request() {
            Some(request) => request,
            None => return,
        };

        let relation = self.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let mut notification = handler(request).await;
            // a notification is a fresh message, never an ACK
            notification.message_type = if relation.probe_due() {
                MessageType::Con
            } else {
                MessageType::Non
            };
            notification.mid = None;
            notification.token = Some(relation.token);
            notification.destination = Some(relation.source);
            trace!(
                "notifying {} about {} ({})",
                relation.source,
                notification.code,
                notification.message_type
            );
            endpoint.respond(&relation.exchange, notification);
        });
    }

    /// Detach from the resource as well; called from both the engine
    /// (RST, CON failure) and the deliverer (Observe=1)
    fn detach(&self) {
        if let Some(resource) = self.resource.upgrade() {
            let relations = resource.relations();
            if let Some(me) = relations
                .iter()
                .find(|r| r.source == self.source && r.token == self.token)
            {
                resource.remove_relation(me);
            }
        }
    }
}

impl granule_engine::ObserveRelation for ObserveRelation {
    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff
    }

    fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            debug!("observe relation {} {} canceled", self.source, self.token);
            self.detach();
            // drop the exchange's matcher state along with the relation
            self.endpoint.release(&self.exchange);
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

// inherent mirrors so callers need not import the trait
impl ObserveRelation {
    pub fn cancel(&self) {
        granule_engine::ObserveRelation::cancel(self);
    }

    pub fn is_canceled(&self) -> bool {
        granule_engine::ObserveRelation::is_canceled(self)
    }
}

/// All relations of one remote peer
pub struct ObservingEndpoint {
    pub address: SocketAddr,
    relations: Mutex<Vec<Arc<ObserveRelation>>>,
}

impl ObservingEndpoint {
    fn new(address: SocketAddr) -> Self {
        ObservingEndpoint {
            address,
            relations: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, relation: Arc<ObserveRelation>) {
        self.relations.lock().push(relation);
    }

    fn remove(&self, token: Token) -> Option<Arc<ObserveRelation>> {
        let mut relations = self.relations.lock();
        let index = relations.iter().position(|r| r.token == token)?;
        Some(relations.remove(index))
    }

    fn cancel_all(&self) {
        for relation in self.relations.lock().drain(..) {
            relation.cancel();
        }
    }
}

/// Registry of observing peers
#[derive(Default)]
pub struct ObserveManager {
    endpoints: DashMap<SocketAddr, Arc<ObservingEndpoint>>,
}

impl ObserveManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new relation: find or create the peer's
    /// `ObservingEndpoint`, attach to it and to the resource, and hang
    /// the relation on the exchange for the observe layer.
    pub fn register(
        &self,
        resource: &Arc<Resource>,
        exchange: &Arc<Exchange>,
        endpoint: &Endpoint,
        request: &Message,
    ) -> Option<Arc<ObserveRelation>> {
        let source = request.source?;
        let token = request.token?;

        let observing = self
            .endpoints
            .entry(source)
            .or_insert_with(|| Arc::new(ObservingEndpoint::new(source)))
            .clone();

        // re-registration with the same token replaces the old relation
        if let Some(old) = observing.remove(token) {
            old.cancel();
        }

        let relation =
            ObserveRelation::new(resource, exchange.clone(), endpoint.clone(), source, token);
        observing.add(relation.clone());
        resource.add_relation(relation.clone());
        exchange.set_relation(relation.clone());
        debug!("observe relation established: {} {}", source, token);
        Some(relation)
    }

    /// Deregistration (Observe=1): cancel the relation with this token
    pub fn deregister(&self, source: SocketAddr, token: Token) {
        if let Some(observing) = self.endpoints.get(&source).map(|e| e.clone()) {
            if let Some(relation) = observing.remove(token) {
                relation.cancel();
            }
        }
    }

    /// Drop every relation of a peer (transport-level death)
    pub fn cancel_endpoint(&self, source: SocketAddr) {
        if let Some((_, observing)) = self.endpoints.remove(&source) {
            observing.cancel_all();
        }
    }

    pub fn observer_count(&self) -> usize {
        self.endpoints
            .iter()
            .map(|e| e.relations.lock().len())
            .sum()
    }
}
