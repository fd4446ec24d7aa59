//! The per-conversation state object
//!
//! One `Exchange` covers one logical request/response conversation, from
//! first request to final response (or failure). Exchanges are owned by
//! the matcher's tables and referenced everywhere else through `Arc`;
//! mutable fields are only written from the executor context the exchange
//! hashes to, so plain mutexes suffice.

use bytes::Bytes;
use granule_core::{Message, Token};
use granule_transport::{Session, SessionId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::keys::{KeyId, KeyToken, KeyUri};

/// Which side created the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This endpoint sent the request
    Local,
    /// A peer's request created the exchange
    Remote,
}

/// A server-side observe relation, attached by the resource tree and
/// consulted by the observe layer. The concrete type lives with the
/// resource tree; the engine only needs the sequence counter and the
/// cancel switch.
pub trait ObserveRelation: Send + Sync {
    /// Next 24-bit notification sequence number
    fn next_sequence(&self) -> u32;

    /// Tear the relation down (no further notifications)
    fn cancel(&self);

    fn is_canceled(&self) -> bool;
}

/// Encoded bytes of the most recent transmission of an exchange, kept so
/// retransmits and duplicate-replay send identical datagrams
#[derive(Debug, Clone)]
pub struct Transmission {
    pub data: Bytes,
    pub remote: SocketAddr,
    pub session: Session,
}

/// In-progress blockwise reassembly or fragmentation state
#[derive(Debug)]
pub struct BlockwiseStatus {
    /// Full body: the assembled prefix (receive side) or the complete
    /// outbound body (send side)
    pub body: Vec<u8>,
    /// Next expected / next to send block number
    pub num: u32,
    /// Negotiated size exponent
    pub szx: u8,
    /// When this transfer started, for lifetime eviction
    pub started: Instant,
    /// Prototype message the remaining blocks are derived from
    pub prototype: Option<Message>,
}

impl BlockwiseStatus {
    pub fn receiving(szx: u8) -> Self {
        BlockwiseStatus {
            body: Vec::new(),
            num: 0,
            szx,
            started: Instant::now(),
            prototype: None,
        }
    }

    pub fn sending(body: Vec<u8>, szx: u8, prototype: Message) -> Self {
        BlockwiseStatus {
            body,
            num: 0,
            szx,
            started: Instant::now(),
            prototype: Some(prototype),
        }
    }

    pub fn block_size(&self) -> usize {
        1 << (self.szx + 4)
    }
}

/// One logical request/response conversation
pub struct Exchange {
    origin: Origin,
    created_at: Instant,
    session: SessionId,
    /// Peer address: source for remote origin, destination for local
    remote: SocketAddr,

    request: Mutex<Option<Message>>,
    current_request: Mutex<Option<Message>>,
    current_response: Mutex<Option<Message>>,

    complete: AtomicBool,
    acknowledged: AtomicBool,

    /// Keys the matcher registered for this exchange, removed on completion
    pub(crate) id_key: Mutex<Option<KeyId>>,
    pub(crate) token_key: Mutex<Option<KeyToken>>,
    pub(crate) response_id_key: Mutex<Option<KeyId>>,
    pub(crate) uri_key: Mutex<Option<KeyUri>>,

    /// Retransmit timer task, aborted on ACK/RST/completion
    retransmission: Mutex<Option<JoinHandle<()>>>,
    /// Retransmit attempt counter
    attempts: Mutex<u32>,
    /// Cached bytes of the last outgoing request (local) or response
    /// (remote), re-sent verbatim on retransmit or duplicate
    last_transmission: Mutex<Option<Transmission>>,

    request_block_status: Mutex<Option<BlockwiseStatus>>,
    response_block_status: Mutex<Option<BlockwiseStatus>>,

    relation: Mutex<Option<Arc<dyn ObserveRelation>>>,

    /// Single-response waiter (plain request/response)
    response_tx: Mutex<Option<oneshot::Sender<Result<Message, EngineError>>>>,
    /// Stream waiter (observe notifications, multicast replies)
    stream_tx: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Exchange {
    pub fn new(origin: Origin, remote: SocketAddr, session: SessionId) -> Self {
        Exchange {
            origin,
            created_at: Instant::now(),
            session,
            remote,
            request: Mutex::new(None),
            current_request: Mutex::new(None),
            current_response: Mutex::new(None),
            complete: AtomicBool::new(false),
            acknowledged: AtomicBool::new(false),
            id_key: Mutex::new(None),
            token_key: Mutex::new(None),
            response_id_key: Mutex::new(None),
            uri_key: Mutex::new(None),
            retransmission: Mutex::new(None),
            attempts: Mutex::new(0),
            last_transmission: Mutex::new(None),
            request_block_status: Mutex::new(None),
            response_block_status: Mutex::new(None),
            relation: Mutex::new(None),
            response_tx: Mutex::new(None),
            stream_tx: Mutex::new(None),
        }
    }

    /// A remote-origin exchange for an inbound request
    pub fn from_remote_request(request: &Message, session: SessionId) -> Arc<Self> {
        let remote = request.source.expect("inbound request carries a source");
        let exchange = Exchange::new(Origin::Remote, remote, session);
        *exchange.request.lock() = Some(request.clone());
        *exchange.current_request.lock() = Some(request.clone());
        Arc::new(exchange)
    }

    /// A fresh exchange for one multicast reply, sharing the original
    /// request but delivering through its own cloned stream sender
    pub fn clone_for_reply(self: &Arc<Self>) -> Arc<Self> {
        let clone = Exchange::new(self.origin, self.remote, self.session);
        *clone.request.lock() = self.request.lock().clone();
        *clone.current_request.lock() = self.current_request.lock().clone();
        *clone.stream_tx.lock() = self.stream_tx.lock().clone();
        Arc::new(clone)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn request(&self) -> Option<Message> {
        self.request.lock().clone()
    }

    pub fn set_request(&self, request: Message) {
        *self.request.lock() = Some(request);
    }

    pub fn current_request(&self) -> Option<Message> {
        self.current_request.lock().clone()
    }

    pub fn set_current_request(&self, request: Message) {
        *self.current_request.lock() = Some(request);
    }

    pub fn current_response(&self) -> Option<Message> {
        self.current_response.lock().clone()
    }

    pub fn set_current_response(&self, response: Message) {
        *self.current_response.lock() = Some(response);
    }

    /// Token of the original request, once assigned
    pub fn token(&self) -> Option<Token> {
        self.request.lock().as_ref().and_then(|r| r.token)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Transition to complete. Returns false when already complete, so
    /// callers run the matcher's completion hook exactly once.
    pub fn set_complete(&self) -> bool {
        let first = !self.complete.swap(true, Ordering::AcqRel);
        if first {
            self.cancel_retransmission();
        }
        first
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    pub fn set_acknowledged(&self) {
        self.acknowledged.store(true, Ordering::Release);
        self.cancel_retransmission();
    }

    /// Re-arm for the next confirmable transmission of this exchange
    /// (follow-up blocks travel with fresh MIDs and fresh timers)
    pub fn clear_acknowledged(&self) {
        self.acknowledged.store(false, Ordering::Release);
    }

    // --- reliability state ---

    pub fn set_retransmission(&self, task: JoinHandle<()>) {
        if let Some(old) = self.retransmission.lock().replace(task) {
            old.abort();
        }
    }

    pub fn cancel_retransmission(&self) {
        if let Some(task) = self.retransmission.lock().take() {
            task.abort();
        }
    }

    pub fn next_attempt(&self) -> u32 {
        let mut attempts = self.attempts.lock();
        *attempts += 1;
        *attempts
    }

    pub fn set_last_transmission(&self, transmission: Transmission) {
        *self.last_transmission.lock() = Some(transmission);
    }

    pub fn last_transmission(&self) -> Option<Transmission> {
        self.last_transmission.lock().clone()
    }

    // --- blockwise state ---

    pub fn request_block_status(&self) -> &Mutex<Option<BlockwiseStatus>> {
        &self.request_block_status
    }

    pub fn response_block_status(&self) -> &Mutex<Option<BlockwiseStatus>> {
        &self.response_block_status
    }

    /// True when either direction has a partial body older than `max_age`
    pub fn blockwise_expired(&self, max_age: std::time::Duration) -> bool {
        let expired = |status: &Option<BlockwiseStatus>| {
            status
                .as_ref()
                .map(|s| s.started.elapsed() > max_age)
                .unwrap_or(false)
        };
        expired(&self.request_block_status.lock()) || expired(&self.response_block_status.lock())
    }

    // --- observe ---

    pub fn relation(&self) -> Option<Arc<dyn ObserveRelation>> {
        self.relation.lock().clone()
    }

    pub fn set_relation(&self, relation: Arc<dyn ObserveRelation>) {
        *self.relation.lock() = Some(relation);
    }

    pub fn remove_relation(&self) -> Option<Arc<dyn ObserveRelation>> {
        self.relation.lock().take()
    }

    // --- delivery toward the local application ---

    pub fn set_response_waiter(&self, tx: oneshot::Sender<Result<Message, EngineError>>) {
        *self.response_tx.lock() = Some(tx);
    }

    pub fn set_stream_waiter(&self, tx: mpsc::Sender<Message>) {
        *self.stream_tx.lock() = Some(tx);
    }

    pub fn has_stream_waiter(&self) -> bool {
        self.stream_tx.lock().is_some()
    }

    /// Hand a response to whoever is waiting. Streams (observe,
    /// multicast) receive every message; the oneshot waiter gets the
    /// first and the rest are dropped.
    pub fn deliver_response(&self, response: Message) {
        if let Some(stream) = self.stream_tx.lock().as_ref() {
            if stream.try_send(response).is_err() {
                tracing::debug!("dropping response: stream waiter gone or full");
            }
            return;
        }
        if let Some(tx) = self.response_tx.lock().take() {
            let _ = tx.send(Ok(response));
        }
    }

    /// Propagate a failure to the waiter and drop the stream
    pub fn fail(&self, error: EngineError) {
        if let Some(tx) = self.response_tx.lock().take() {
            let _ = tx.send(Err(error));
        }
        self.stream_tx.lock().take();
        if let Some(relation) = self.remove_relation() {
            relation.cancel();
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("origin", &self.origin)
            .field("remote", &self.remote)
            .field("complete", &self.is_complete())
            .field("acknowledged", &self.is_acknowledged())
            .field("token", &self.token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_core::Code;

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn test_set_complete_runs_once() {
        let exchange = Exchange::new(Origin::Local, addr(), SessionId::new());
        assert!(exchange.set_complete());
        assert!(!exchange.set_complete());
        assert!(exchange.is_complete());
    }

    #[tokio::test]
    async fn test_oneshot_delivery() {
        let exchange = Exchange::new(Origin::Local, addr(), SessionId::new());
        let (tx, rx) = oneshot::channel();
        exchange.set_response_waiter(tx);

        let response = Message::response(granule_core::MessageType::Ack, Code::CONTENT);
        exchange.deliver_response(response);
        let delivered = rx.await.unwrap().unwrap();
        assert_eq!(delivered.code, Code::CONTENT);
    }

    #[tokio::test]
    async fn test_stream_delivery_wins_over_oneshot() {
        let exchange = Exchange::new(Origin::Local, addr(), SessionId::new());
        let (otx, mut orx) = oneshot::channel();
        let (stx, mut srx) = mpsc::channel(4);
        exchange.set_response_waiter(otx);
        exchange.set_stream_waiter(stx);

        exchange.deliver_response(Message::response(granule_core::MessageType::Non, Code::CONTENT));
        assert!(srx.try_recv().is_ok());
        assert!(orx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_reaches_waiter() {
        let exchange = Exchange::new(Origin::Local, addr(), SessionId::new());
        let (tx, rx) = oneshot::channel();
        exchange.set_response_waiter(tx);
        exchange.fail(EngineError::Rejected);
        assert!(matches!(rx.await.unwrap(), Err(EngineError::Rejected)));
    }

    #[tokio::test]
    async fn test_multicast_clone_shares_stream() {
        let exchange = Arc::new(Exchange::new(Origin::Local, addr(), SessionId::new()));
        let (stx, mut srx) = mpsc::channel(4);
        exchange.set_stream_waiter(stx);

        let clone = exchange.clone_for_reply();
        clone.deliver_response(Message::response(granule_core::MessageType::Non, Code::CONTENT));
        assert!(srx.try_recv().is_ok());
    }
}
