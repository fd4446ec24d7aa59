//! The endpoint façade
//!
//! Composes a channel, the codec, the matcher, the stack, and the
//! executor. Datagrams come in through the channel's event stream, are
//! decoded and classified, matched to an exchange, and pushed bottom-up
//! through the stack; outgoing messages fall out of the stack's bottom
//! into the endpoint's outbox, which registers them with the matcher,
//! encodes them, and queues them on the channel. The outbound queue is a
//! single mpsc consumed by one sender task, preserving FIFO order per
//! peer.

use granule_core::{codec, Code, Decoded, Message, MessageType, Scheme};
use granule_transport::{Channel, ChannelEvent, Datagram, Session};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventRegistry};
use crate::exchange::{Exchange, Origin, Transmission};
use crate::executor::{Executor, Job, OrderingKey};
use crate::layers::{MessageDeliverer, Outbox, Stack, StackContext, StackTop};
use crate::matcher::Matcher;

/// Depth of the outbound datagram queue
const OUTBOUND_QUEUE_DEPTH: usize = 128;

/// A CoAP endpoint over one datagram channel.
///
/// Cheap to clone; all clones drive the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

pub(crate) struct EndpointInner {
    self_ref: Weak<EndpointInner>,
    config: Config,
    channel: Arc<dyn Channel>,
    matcher: Matcher,
    stack: Stack,
    executor: Mutex<Option<Arc<Executor>>>,
    events: EventRegistry,
    deliverer: RwLock<Arc<dyn MessageDeliverer>>,
    outbound: Mutex<Option<mpsc::Sender<Transmission>>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Rejects every request with 4.04 until a real deliverer is installed
struct NotFoundDeliverer;

impl MessageDeliverer for NotFoundDeliverer {
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Message, endpoint: Endpoint) {
        debug!("no deliverer installed, answering 4.04");
        let response = Message::respond_to(&request, Code::NOT_FOUND);
        endpoint.respond(&exchange, response);
    }
}

/// Cancels or inspects an in-flight client request
pub struct RequestHandle {
    exchange: Arc<Exchange>,
    endpoint: Endpoint,
}

impl RequestHandle {
    /// Stop the request: no more retransmits, waiters see `Canceled`
    pub fn cancel(&self) {
        if let Some(request) = self.exchange.current_request() {
            request.cancel();
        }
        let exchange = self.exchange.clone();
        let endpoint = self.endpoint.clone();
        self.endpoint.post(
            OrderingKey::new(exchange.remote(), &[]),
            Box::new(move || endpoint.fail_exchange(&exchange, EngineError::Canceled)),
        );
    }

    /// Token of the underlying request, once assigned
    pub fn token(&self) -> Option<granule_core::Token> {
        self.exchange.token()
    }
}

impl Endpoint {
    pub fn new(channel: Arc<dyn Channel>, config: Config) -> Self {
        let matcher = Matcher::new(&config);
        let stack = Stack::new(&config);
        let inner = Arc::new_cyclic(|self_ref| EndpointInner {
            self_ref: self_ref.clone(),
            config,
            channel,
            matcher,
            stack,
            executor: Mutex::new(None),
            events: EventRegistry::new(),
            deliverer: RwLock::new(Arc::new(NotFoundDeliverer)),
            outbound: Mutex::new(None),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        Endpoint { inner }
    }

    /// Install the request dispatcher (the server's resource tree)
    pub fn set_deliverer(&self, deliverer: Arc<dyn MessageDeliverer>) {
        *self.inner.deliverer.write() = deliverer;
    }

    pub fn add_observer(&self, observer: Arc<dyn crate::events::EndpointObserver>) {
        self.inner.events.add(observer);
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn local_addr(&self) -> granule_transport::Result<SocketAddr> {
        self.inner.channel.local_addr()
    }

    /// Whether this endpoint serves a URI scheme: `coap` over plain
    /// channels, `coaps` over DTLS
    pub fn serves_scheme(&self, scheme: Scheme) -> bool {
        match scheme {
            Scheme::Coap => !self.inner.channel.is_secure(),
            Scheme::Coaps => self.inner.channel.is_secure(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Bind the channel and start pumping. Idempotent: a second start is
    /// a no-op.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let config = &self.inner.config;
        *self.inner.executor.lock() = Some(Arc::new(Executor::pool(
            config.executor_workers,
            config.executor_queue_depth,
        )));

        let mut events = match self.inner.channel.start().await {
            Ok(events) => events,
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Transmission>(OUTBOUND_QUEUE_DEPTH);
        *self.inner.outbound.lock() = Some(outbound_tx);

        let mut tasks = self.inner.tasks.lock();

        // outbound sender: one consumer keeps per-peer FIFO ordering
        let channel = self.inner.channel.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(transmission) = outbound_rx.recv().await {
                if let Err(e) = channel
                    .send(
                        transmission.data,
                        Some(&transmission.session),
                        transmission.remote,
                    )
                    .await
                {
                    warn!("channel send to {} failed: {}", transmission.remote, e);
                }
            }
        }));

        // receive pump: datagrams become executor jobs, keyed by peer
        let endpoint = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Data(datagram) => {
                        let key = OrderingKey::new(datagram.source, &[]);
                        let worker = endpoint.clone();
                        endpoint.post(key, Box::new(move || worker.process_datagram(datagram)));
                    }
                    ChannelEvent::Error(e) => warn!("channel error: {}", e),
                    ChannelEvent::Stopped { reason } => {
                        info!("channel stopped: {:?}", reason);
                        break;
                    }
                }
            }
        }));

        // maintenance: dedup sweep/rotation and stale blockwise eviction
        let endpoint = self.clone();
        let sweep_interval = config.mark_and_sweep_interval;
        let blockwise_lifetime = config.blockwise_status_lifetime;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                endpoint.inner.matcher.dedup().maintain();
                endpoint
                    .inner
                    .matcher
                    .evict_stale_blockwise(blockwise_lifetime);
            }
        }));

        info!("endpoint started on {:?}", self.local_addr().ok());
        Ok(())
    }

    /// Stop pumping and release the channel
    pub async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(executor) = self.inner.executor.lock().take() {
            executor.shutdown();
        }
        self.inner.outbound.lock().take();
        self.inner.channel.stop().await;
        info!("endpoint stopped");
    }

    // --- client-facing send paths ---

    /// Send a request and receive the single matching response
    pub fn send_request(
        &self,
        request: Message,
    ) -> Result<oneshot::Receiver<std::result::Result<Message, EngineError>>> {
        let (exchange, request) = self.prepare_request(request)?;
        let (tx, rx) = oneshot::channel();
        exchange.set_response_waiter(tx);
        self.submit_request(exchange, request);
        Ok(rx)
    }

    /// Send a request whose responses arrive as a stream: observe
    /// notifications or multicast replies
    pub fn send_request_streaming(
        &self,
        request: Message,
        capacity: usize,
    ) -> Result<(mpsc::Receiver<Message>, RequestHandle)> {
        let (exchange, request) = self.prepare_request(request)?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        exchange.set_stream_waiter(tx);
        let handle = RequestHandle {
            exchange: exchange.clone(),
            endpoint: self.clone(),
        };
        self.submit_request(exchange, request);
        Ok((rx, handle))
    }

    /// CoAP ping: empty CON answered by RST. The receiver resolves with
    /// `Err(Rejected)` on pong, which callers map to success.
    pub fn ping(
        &self,
        remote: SocketAddr,
    ) -> Result<oneshot::Receiver<std::result::Result<Message, EngineError>>> {
        if !self.is_running() {
            return Err(EngineError::Stopped);
        }
        let session = self.inner.channel.session(remote);
        let exchange = Arc::new(Exchange::new(Origin::Local, remote, session.id));
        let message = Message::ping(remote);
        exchange.set_current_request(message.clone());
        let (tx, rx) = oneshot::channel();
        exchange.set_response_waiter(tx);

        let endpoint = self.clone();
        self.post(
            OrderingKey::new(remote, &[]),
            Box::new(move || {
                let inner = &*endpoint.inner;
                let ctx = StackContext::new(&inner.config, &endpoint, &inner.stack, inner, inner);
                inner.stack.send_empty(&ctx, Some(&exchange), message);
            }),
        );
        Ok(rx)
    }

    /// Send a bare ACK for a server-side exchange whose real response
    /// comes later (separate response)
    pub fn acknowledge(&self, exchange: &Arc<Exchange>) {
        let request = match exchange.current_request() {
            Some(request) => request,
            None => return,
        };
        let (mid, source) = match (request.mid, request.source) {
            (Some(mid), Some(source)) => (mid, source),
            _ => return,
        };
        let ack = Message::empty_ack(mid, source);
        let exchange = exchange.clone();
        let endpoint = self.clone();
        self.post(
            OrderingKey::new(exchange.remote(), &[]),
            Box::new(move || {
                let inner = &*endpoint.inner;
                let ctx = StackContext::new(&inner.config, &endpoint, &inner.stack, inner, inner);
                inner.stack.send_empty(&ctx, Some(&exchange), ack);
            }),
        );
    }

    /// Complete an exchange administratively (observe relation torn
    /// down, transfer abandoned) and drop its matcher state
    pub fn release(&self, exchange: &Arc<Exchange>) {
        let exchange = exchange.clone();
        let endpoint = self.clone();
        self.post(
            OrderingKey::new(exchange.remote(), &[]),
            Box::new(move || {
                if exchange.set_complete() {
                    endpoint.inner.matcher.complete(&exchange);
                }
            }),
        );
    }

    /// Send a response for a server-side exchange
    pub fn respond(&self, exchange: &Arc<Exchange>, response: Message) {
        let exchange = exchange.clone();
        let endpoint = self.clone();
        self.post(
            OrderingKey::new(exchange.remote(), &[]),
            Box::new(move || {
                let inner = &*endpoint.inner;
                let ctx = StackContext::new(&inner.config, &endpoint, &inner.stack, inner, inner);
                inner.stack.send_response(&ctx, &exchange, response);
            }),
        );
    }

    fn prepare_request(&self, mut request: Message) -> Result<(Arc<Exchange>, Message)> {
        if !self.is_running() {
            return Err(EngineError::Stopped);
        }
        let remote = request.destination.ok_or(EngineError::NoDestination)?;
        // multicast requests must be non-confirmable
        if request.is_multicast() {
            request.message_type = MessageType::Non;
        }
        let session = self.inner.channel.session(remote);
        let exchange = Arc::new(Exchange::new(Origin::Local, remote, session.id));
        Ok((exchange, request))
    }

    fn submit_request(&self, exchange: Arc<Exchange>, request: Message) {
        let endpoint = self.clone();
        self.post(
            OrderingKey::new(exchange.remote(), &[]),
            Box::new(move || {
                let inner = &*endpoint.inner;
                let ctx = StackContext::new(&inner.config, &endpoint, &inner.stack, inner, inner);
                inner.stack.send_request(&ctx, &exchange, request);
            }),
        );
    }

    // --- engine-internal plumbing ---

    pub(crate) fn post(&self, key: OrderingKey, job: Job) {
        let executor = self.inner.executor.lock().clone();
        match executor {
            Some(executor) => executor.execute(key, job),
            None => debug!("endpoint not started, dropping job"),
        }
    }

    /// Queue raw bytes for transmission (retransmits, duplicate replay)
    pub(crate) fn transmit_raw(&self, transmission: Transmission) {
        self.inner.enqueue(transmission);
    }

    /// Re-send an exchange's cached datagram
    pub(crate) fn transmit_cached(&self, exchange: &Arc<Exchange>) {
        if let Some(transmission) = exchange.last_transmission() {
            self.inner.enqueue(transmission);
        }
    }

    /// Fail an exchange and run the completion hook
    pub(crate) fn fail_exchange(&self, exchange: &Arc<Exchange>, error: EngineError) {
        self.inner.fail_exchange(exchange, error);
    }

    /// Decode, classify, and route one datagram (runs as an executor job)
    fn process_datagram(&self, datagram: Datagram) {
        let inner = &*self.inner;
        let session = datagram.session.clone();

        let decoded = match codec::decode(&datagram.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("undecodable datagram from {}: {}", datagram.source, e);
                self.reject_raw(&datagram.data, datagram.source, &session);
                return;
            }
        };

        let ctx = StackContext::new(&inner.config, self, &inner.stack, inner, inner);

        match decoded {
            Decoded::Request(mut request) => {
                request.source = Some(datagram.source);
                request.destination = datagram.destination;
                inner.events.notify(Event::ReceivingRequest, &request);
                let exchange = inner.matcher.receive_request(&mut request, session.id);
                inner.stack.receive_request(&ctx, &exchange, request);
            }
            Decoded::Response(mut response) => {
                response.source = Some(datagram.source);
                response.destination = datagram.destination;
                inner.events.notify(Event::ReceivingResponse, &response);
                match inner.matcher.receive_response(&mut response, session.id) {
                    Some(exchange) => {
                        inner.stack.receive_response(&ctx, &exchange, response);
                    }
                    None => {
                        if response.message_type != MessageType::Ack {
                            debug!("unmatchable response from {}, rejecting", datagram.source);
                            if let Some(rst) = Message::reject(&response) {
                                inner.send_empty(None, rst);
                            }
                        } else {
                            trace!("unmatchable piggyback ack, dropping");
                        }
                    }
                }
            }
            Decoded::Empty(mut message) => {
                message.source = Some(datagram.source);
                message.destination = datagram.destination;
                inner.events.notify(Event::ReceivingEmpty, &message);
                if message.message_type.expects_reply() {
                    // CoAP ping: answer with RST
                    trace!("ping from {}", datagram.source);
                    if let Some(rst) = Message::reject(&message) {
                        inner.send_empty(None, rst);
                    }
                    return;
                }
                match inner.matcher.receive_empty(&message, session.id) {
                    Some(exchange) => {
                        inner.stack.receive_empty(&ctx, Some(&exchange), message);
                    }
                    None => trace!("unmatchable {} from {}", message.message_type, datagram.source),
                }
            }
            Decoded::Signal(message) => {
                // signaling belongs to reliable transports; over datagrams
                // it is a peer error
                warn!(
                    "signaling message {} from {} over datagram transport",
                    message.code, datagram.source
                );
                if message.message_type.expects_reply() {
                    if let Some(rst) = Message::reject(&message) {
                        inner.send_empty(None, rst);
                    }
                }
            }
        }
    }

    /// A datagram that did not decode: reply RST if the header says the
    /// peer expects one, otherwise drop
    fn reject_raw(&self, data: &[u8], source: SocketAddr, _session: &Session) {
        if data.len() < codec::HEADER_SIZE {
            return;
        }
        let message_type = (data[0] >> 4) & 0x03;
        if message_type >= MessageType::Ack as u8 {
            // the malformed message was itself a reply
            return;
        }
        let mid = u16::from_be_bytes([data[2], data[3]]);
        self.inner.send_empty(None, Message::rst(mid, source));
    }
}

impl EndpointInner {
    fn handle(&self) -> Option<Endpoint> {
        self.self_ref.upgrade().map(|inner| Endpoint { inner })
    }

    fn session_for(&self, remote: SocketAddr) -> Session {
        self.channel.session(remote)
    }

    fn enqueue(&self, transmission: Transmission) {
        let sender = self.outbound.lock().clone();
        match sender {
            Some(sender) => {
                if sender.try_send(transmission).is_err() {
                    warn!("outbound queue full, dropping datagram");
                }
            }
            None => debug!("endpoint not started, dropping datagram"),
        }
    }

    fn fail_exchange(&self, exchange: &Arc<Exchange>, error: EngineError) {
        debug!("exchange failed: {:?}: {}", exchange, error);
        exchange.fail(error);
        if exchange.set_complete() {
            self.matcher.complete(exchange);
        }
    }

    /// Encode and queue, caching the bytes on the exchange for
    /// retransmits and duplicate replay
    fn encode_and_enqueue(&self, exchange: Option<&Arc<Exchange>>, message: &Message) {
        let remote = match message.destination {
            Some(remote) => remote,
            None => {
                warn!("outgoing message without destination, dropping");
                return;
            }
        };
        match codec::encode(message) {
            Ok(data) => {
                let transmission = Transmission {
                    data,
                    remote,
                    session: self.session_for(remote),
                };
                if let Some(exchange) = exchange {
                    exchange.set_last_transmission(transmission.clone());
                }
                self.enqueue(transmission);
            }
            Err(e) => {
                warn!("encode failed: {}", e);
                if let Some(exchange) = exchange {
                    self.fail_exchange(exchange, e.into());
                }
            }
        }
    }
}

/// Bottom of the stack: register with the matcher, encode, queue
impl Outbox for EndpointInner {
    fn send_request(&self, exchange: &Arc<Exchange>, mut request: Message) {
        let remote = match request.destination {
            Some(remote) => remote,
            None => {
                self.fail_exchange(exchange, EngineError::NoDestination);
                return;
            }
        };
        let session = self.session_for(remote);
        if let Err(e) = self.matcher.send_request(exchange, &mut request, session.id) {
            self.fail_exchange(exchange, e);
            return;
        }
        self.events.notify(Event::SendingRequest, &request);
        self.encode_and_enqueue(Some(exchange), &request);
    }

    fn send_response(&self, exchange: &Arc<Exchange>, mut response: Message) {
        if response.destination.is_none() {
            response.destination = Some(exchange.remote());
        }
        let session = self.session_for(exchange.remote());
        self.matcher.send_response(exchange, &mut response, session.id);
        self.events.notify(Event::SendingResponse, &response);
        self.encode_and_enqueue(Some(exchange), &response);
    }

    fn send_empty(&self, exchange: Option<&Arc<Exchange>>, mut message: Message) {
        let remote = match message.destination.or(exchange.map(|e| e.remote())) {
            Some(remote) => remote,
            None => return,
        };
        message.destination = Some(remote);
        let session = self.session_for(remote);
        self.matcher.send_empty(exchange, &mut message, session.id);
        self.events.notify(Event::SendingEmpty, &message);
        self.encode_and_enqueue(exchange, &message);
    }
}

/// Top of the stack: deliver to the application or the waiter
impl StackTop for EndpointInner {
    fn request_delivered(&self, exchange: &Arc<Exchange>, request: Message) {
        let deliverer = self.deliverer.read().clone();
        match self.handle() {
            Some(endpoint) => deliverer.deliver_request(exchange.clone(), request, endpoint),
            None => debug!("endpoint gone, dropping request"),
        }
    }

    fn response_delivered(&self, exchange: &Arc<Exchange>, response: Message) {
        let is_notification = response
            .options
            .contains(granule_core::option::number::OBSERVE);
        // a final response ends a locally originated exchange; an
        // observe notification keeps it alive
        if !is_notification && exchange.origin() == Origin::Local && exchange.set_complete() {
            self.matcher.complete(exchange);
        }
        let deliverer = self.deliverer.read().clone();
        deliverer.deliver_response(exchange.clone(), response);
    }

    fn empty_delivered(&self, exchange: Option<&Arc<Exchange>>, message: Message) {
        if let Some(exchange) = exchange {
            if message.message_type == MessageType::Rst {
                self.fail_exchange(exchange, EngineError::Rejected);
            }
            // a bare ACK leaves the exchange open for the separate response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_transport::UdpChannel;
    use std::time::Duration;

    async fn started_endpoint() -> Endpoint {
        let channel = Arc::new(
            UdpChannel::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let endpoint = Endpoint::new(channel, Config::default());
        endpoint.start().await.unwrap();
        endpoint
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let endpoint = started_endpoint().await;
        assert!(endpoint.is_running());
        endpoint.start().await.unwrap();
        assert!(endpoint.is_running());
        endpoint.stop().await;
        assert!(!endpoint.is_running());
    }

    #[tokio::test]
    async fn test_send_request_requires_destination() {
        let endpoint = started_endpoint().await;
        let request = Message::request(Code::GET, true);
        assert!(matches!(
            endpoint.send_request(request),
            Err(EngineError::NoDestination)
        ));
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_send_request_before_start_fails() {
        let channel = Arc::new(
            UdpChannel::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let endpoint = Endpoint::new(channel, Config::default());
        let mut request = Message::request(Code::GET, true);
        request.destination = Some("127.0.0.1:5683".parse().unwrap());
        assert!(matches!(
            endpoint.send_request(request),
            Err(EngineError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_ping_pong_between_endpoints() {
        let server = started_endpoint().await;
        let client = started_endpoint().await;
        let server_addr: SocketAddr =
            format!("127.0.0.1:{}", server.local_addr().unwrap().port())
                .parse()
                .unwrap();

        let rx = client.ping(server_addr).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        // pong is an RST, surfaced as Rejected
        assert!(matches!(outcome, Err(EngineError::Rejected)));

        client.stop().await;
        server.stop().await;
    }
}
