//! The protocol stack
//!
//! An ordered chain of layers between the application and the wire,
//! closest-to-application first:
//!
//! 1. Observe - notification sequence numbers, relation cancellation
//! 2. Blockwise - fragmentation and reassembly of large bodies
//! 3. Token - token-presence invariants
//! 4. Reliability - CON retransmission with exponential back-off
//!
//! Send events traverse top-down and fall out of the bottom into the
//! [`Outbox`] (the endpoint, which registers with the matcher, encodes,
//! and queues the datagram). Receive events traverse bottom-up and fall
//! out of the top into the [`StackTop`] (delivery to the application or
//! to the exchange's waiter). A layer may consume an event, transform
//! it, or forward it; cancellation is checked at every boundary.

mod blockwise;
mod observe;
mod reliability;
mod token;

pub use blockwise::BlockwiseLayer;
pub use observe::ObserveLayer;
pub use reliability::ReliabilityLayer;
pub use token::TokenLayer;

use granule_core::Message;
use std::sync::Arc;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::EngineError;
use crate::exchange::Exchange;

/// Bottom of the stack: register, encode, and queue outgoing messages
pub trait Outbox: Send + Sync {
    fn send_request(&self, exchange: &Arc<Exchange>, request: Message);
    fn send_response(&self, exchange: &Arc<Exchange>, response: Message);
    fn send_empty(&self, exchange: Option<&Arc<Exchange>>, message: Message);
}

/// Top of the stack: deliver fully-processed inbound messages
pub trait StackTop: Send + Sync {
    fn request_delivered(&self, exchange: &Arc<Exchange>, request: Message);
    fn response_delivered(&self, exchange: &Arc<Exchange>, response: Message);
    fn empty_delivered(&self, exchange: Option<&Arc<Exchange>>, message: Message);
}

/// Dispatches inbound requests to application code. The server crate
/// implements this over its resource tree; the default rejects
/// everything with 4.04.
pub trait MessageDeliverer: Send + Sync {
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Message, endpoint: Endpoint);

    /// Responses normally go straight to the exchange's waiter
    fn deliver_response(&self, exchange: Arc<Exchange>, response: Message) {
        exchange.deliver_response(response);
    }
}

/// A layer's position in the chain, used to address its neighbors
#[derive(Debug, Clone, Copy)]
pub struct LayerAt {
    index: usize,
}

/// One protocol layer. Defaults forward every event unchanged.
#[allow(unused_variables)]
pub trait Layer: Send + Sync {
    fn send_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        ctx.send_request_below(at, exchange, request);
    }

    fn send_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        ctx.send_response_below(at, exchange, response);
    }

    fn send_empty(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        ctx.send_empty_below(at, exchange, message);
    }

    fn receive_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        ctx.forward_receive_request(at, exchange, request);
    }

    fn receive_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        ctx.forward_receive_response(at, exchange, response);
    }

    fn receive_empty(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        ctx.forward_receive_empty(at, exchange, message);
    }
}

/// The assembled chain
pub struct Stack {
    layers: Vec<Box<dyn Layer>>,
}

impl Stack {
    /// The standard four-layer chain
    pub fn new(config: &Config) -> Self {
        Stack {
            layers: vec![
                Box::new(ObserveLayer::new()),
                Box::new(BlockwiseLayer::new(config)),
                Box::new(TokenLayer::new()),
                Box::new(ReliabilityLayer::new(config)),
            ],
        }
    }

    /// A chain with custom layers, for tests
    pub fn with_layers(layers: Vec<Box<dyn Layer>>) -> Self {
        Stack { layers }
    }

    pub fn send_request(&self, ctx: &StackContext<'_>, exchange: &Arc<Exchange>, request: Message) {
        ctx.send_request_at(0, exchange, request);
    }

    pub fn send_response(
        &self,
        ctx: &StackContext<'_>,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        ctx.send_response_at(0, exchange, response);
    }

    pub fn send_empty(
        &self,
        ctx: &StackContext<'_>,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        ctx.send_empty_at(0, exchange, message);
    }

    pub fn receive_request(
        &self,
        ctx: &StackContext<'_>,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        ctx.receive_request_at(self.layers.len(), exchange, request);
    }

    pub fn receive_response(
        &self,
        ctx: &StackContext<'_>,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        ctx.receive_response_at(self.layers.len(), exchange, response);
    }

    pub fn receive_empty(
        &self,
        ctx: &StackContext<'_>,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        ctx.receive_empty_at(self.layers.len(), exchange, message);
    }
}

/// Everything a layer can reach during one event
pub struct StackContext<'a> {
    pub config: &'a Config,
    /// Handle for timers and raw retransmits; cheap to clone into tasks
    pub endpoint: &'a Endpoint,
    stack: &'a Stack,
    outbox: &'a dyn Outbox,
    top: &'a dyn StackTop,
}

impl<'a> StackContext<'a> {
    pub fn new(
        config: &'a Config,
        endpoint: &'a Endpoint,
        stack: &'a Stack,
        outbox: &'a dyn Outbox,
        top: &'a dyn StackTop,
    ) -> Self {
        StackContext {
            config,
            endpoint,
            stack,
            outbox,
            top,
        }
    }

    // --- send direction (top-down, index increasing) ---

    /// Pass a message on below this layer. Also the way a receive
    /// handler injects a new message downward (the next block of a
    /// transfer, the ACK for a separate response).
    pub fn send_request_below(&self, at: LayerAt, exchange: &Arc<Exchange>, request: Message) {
        self.send_request_at(at.index + 1, exchange, request);
    }

    pub fn send_response_below(&self, at: LayerAt, exchange: &Arc<Exchange>, response: Message) {
        self.send_response_at(at.index + 1, exchange, response);
    }

    pub fn send_empty_below(
        &self,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        self.send_empty_at(at.index + 1, exchange, message);
    }

    fn send_request_at(&self, index: usize, exchange: &Arc<Exchange>, request: Message) {
        if request.is_canceled() {
            self.endpoint.fail_exchange(exchange, EngineError::Canceled);
            return;
        }
        match self.stack.layers.get(index) {
            Some(layer) => layer.send_request(self, LayerAt { index }, exchange, request),
            None => self.outbox.send_request(exchange, request),
        }
    }

    fn send_response_at(&self, index: usize, exchange: &Arc<Exchange>, response: Message) {
        if response.is_canceled() {
            return;
        }
        match self.stack.layers.get(index) {
            Some(layer) => layer.send_response(self, LayerAt { index }, exchange, response),
            None => self.outbox.send_response(exchange, response),
        }
    }

    fn send_empty_at(&self, index: usize, exchange: Option<&Arc<Exchange>>, message: Message) {
        if message.is_canceled() {
            return;
        }
        match self.stack.layers.get(index) {
            Some(layer) => layer.send_empty(self, LayerAt { index }, exchange, message),
            None => self.outbox.send_empty(exchange, message),
        }
    }

    // --- receive direction (bottom-up, position decreasing) ---

    pub fn forward_receive_request(&self, at: LayerAt, exchange: &Arc<Exchange>, request: Message) {
        self.receive_request_at(at.index, exchange, request);
    }

    pub fn forward_receive_response(
        &self,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        self.receive_response_at(at.index, exchange, response);
    }

    pub fn forward_receive_empty(
        &self,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        self.receive_empty_at(at.index, exchange, message);
    }

    fn receive_request_at(&self, position: usize, exchange: &Arc<Exchange>, request: Message) {
        match position {
            0 => self.top.request_delivered(exchange, request),
            _ => {
                let index = position - 1;
                self.stack.layers[index].receive_request(self, LayerAt { index }, exchange, request)
            }
        }
    }

    fn receive_response_at(&self, position: usize, exchange: &Arc<Exchange>, response: Message) {
        match position {
            0 => self.top.response_delivered(exchange, response),
            _ => {
                let index = position - 1;
                self.stack.layers[index].receive_response(
                    self,
                    LayerAt { index },
                    exchange,
                    response,
                )
            }
        }
    }

    fn receive_empty_at(
        &self,
        position: usize,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        match position {
            0 => self.top.empty_delivered(exchange, message),
            _ => {
                let index = position - 1;
                self.stack.layers[index].receive_empty(self, LayerAt { index }, exchange, message)
            }
        }
    }
}
