//! Token layer
//!
//! Guards the token invariant at the application boundary: every message
//! that crosses it carries a token, where "empty" is the zero-length
//! token and "absent" is a programming error. Inbound violations are
//! logged and dropped rather than propagated.

use granule_core::Message;
use std::sync::Arc;
use tracing::warn;

use crate::exchange::Exchange;
use crate::layers::{Layer, LayerAt, StackContext};

#[derive(Default)]
pub struct TokenLayer;

impl TokenLayer {
    pub fn new() -> Self {
        TokenLayer
    }
}

impl Layer for TokenLayer {
    fn receive_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        if request.token.is_none() {
            warn!("dropping request without token from {:?}", request.source);
            return;
        }
        ctx.forward_receive_request(at, exchange, request);
    }

    fn receive_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        if response.token.is_none() {
            warn!("dropping response without token from {:?}", response.source);
            return;
        }
        ctx.forward_receive_response(at, exchange, response);
    }
}
