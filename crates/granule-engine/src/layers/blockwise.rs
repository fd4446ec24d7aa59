//! Blockwise layer (RFC 7959)
//!
//! Bodies larger than the preferred block size are carried as a sequence
//! of Block1 (request body) or Block2 (response body) messages. The layer
//! fragments on the way down and reassembles on the way up, so everything
//! above it only ever sees complete bodies. Transfer state lives on the
//! exchange; partial bodies are evicted by the endpoint's maintenance
//! timer once they exceed the configured lifetime.

use bytes::Bytes;
use granule_core::option::number;
use granule_core::{BlockOption, Code, Message};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::exchange::{BlockwiseStatus, Exchange};
use crate::layers::{Layer, LayerAt, StackContext};

pub struct BlockwiseLayer {
    szx: u8,
    block_size: usize,
}

impl BlockwiseLayer {
    pub fn new(config: &Config) -> Self {
        let szx = BlockOption::szx_for_size(config.preferred_block_size);
        BlockwiseLayer {
            szx,
            block_size: 1 << (szx + 4),
        }
    }

    /// Slice `body` for block `num` of size `1 << (szx + 4)`
    fn slice(body: &[u8], num: u32, szx: u8) -> (Bytes, bool) {
        let size = 1usize << (szx + 4);
        let offset = num as usize * size;
        if offset >= body.len() {
            return (Bytes::new(), false);
        }
        let end = (offset + size).min(body.len());
        (Bytes::copy_from_slice(&body[offset..end]), end < body.len())
    }

    /// Next Block1 request derived from the transfer prototype
    fn next_request_block(exchange: &Arc<Exchange>) -> Option<Message> {
        let mut guard = exchange.request_block_status().lock();
        let status = guard.as_mut()?;
        let prototype = status.prototype.clone()?;
        let num = status.num;
        let szx = status.szx;
        let (payload, more) = Self::slice(&status.body, num, szx);
        if payload.is_empty() {
            return None;
        }
        status.num += 1;
        drop(guard);

        let mut next = prototype;
        next.mid = None;
        next.token = exchange.token();
        next.payload = payload;
        next.options.set_block1(BlockOption::new(num, more, szx));
        Some(next)
    }
}

impl Layer for BlockwiseLayer {
    fn send_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        if request.payload.len() <= self.block_size || request.options.block1().is_some() {
            ctx.send_request_below(at, exchange, request);
            return;
        }

        let body = request.payload.to_vec();
        let total = body.len();
        let mut status = BlockwiseStatus::sending(body, self.szx, request.clone());
        let (payload, more) = Self::slice(&status.body, 0, self.szx);
        status.num = 1;

        let mut first = request;
        first.payload = payload;
        first.options.set_block1(BlockOption::new(0, more, self.szx));
        first.options.set_uint(number::SIZE1, total as u64);

        *exchange.request_block_status().lock() = Some(status);
        debug!("fragmenting {} byte request body into blocks", total);
        ctx.send_request_below(at, exchange, first);
    }

    fn send_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        mut response: Message,
    ) {
        let request = exchange.current_request();

        // final response of a Block1 transfer echoes the last block
        if response.options.block1().is_none() && response.code.is_success() {
            if let Some(b1) = request.as_ref().and_then(|r| r.options.block1()) {
                response
                    .options
                    .set_block1(BlockOption::new(b1.num, false, b1.szx));
            }
        }

        let requested = request.as_ref().and_then(|r| r.options.block2());
        let needs_fragment = response.code.is_success()
            && response.options.block2().is_none()
            && (response.payload.len() > self.block_size || requested.is_some());

        if !needs_fragment {
            ctx.send_response_below(at, exchange, response);
            return;
        }

        let szx = requested.map(|b| b.szx.min(self.szx)).unwrap_or(self.szx);
        let size = 1usize << (szx + 4);
        // the byte offset the peer asked for is szx-invariant
        let offset = requested.map(|b| b.offset()).unwrap_or(0);
        let num = (offset / size) as u32;
        let body = response.payload.to_vec();
        let total = body.len();
        let is_notification = response.options.contains(number::OBSERVE);

        let (payload, more) = Self::slice(&body, num, szx);
        let mut first = response.clone();
        first.payload = payload;
        first.options.set_block2(BlockOption::new(num, more, szx));
        if num == 0 {
            first.options.set_uint(number::SIZE2, total as u64);
        }

        // observe notifications carry only the first block and keep no
        // transfer state; observers fetch the rest with plain requests
        if !is_notification && more {
            *exchange.response_block_status().lock() =
                Some(BlockwiseStatus::sending(body, szx, response));
        }
        ctx.send_response_below(at, exchange, first);
    }

    fn receive_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        if let Some(b1) = request.options.block1() {
            if b1.num == 0 {
                *exchange.request_block_status().lock() =
                    Some(BlockwiseStatus::receiving(b1.szx.min(self.szx)));
            }

            let mut guard = exchange.request_block_status().lock();
            let status = match guard.as_mut() {
                Some(status) => status,
                None => {
                    drop(guard);
                    warn!("block1 {} without transfer state", b1.num);
                    let mut error =
                        Message::respond_to(&request, Code::REQUEST_ENTITY_INCOMPLETE);
                    error.payload = Bytes::from_static(b"no ongoing transfer");
                    ctx.send_response_below(at, exchange, error);
                    return;
                }
            };

            if b1.num != status.num {
                debug!("block1 gap: got {}, expected {}", b1.num, status.num);
                drop(guard);
                let error = Message::respond_to(&request, Code::REQUEST_ENTITY_INCOMPLETE);
                ctx.send_response_below(at, exchange, error);
                return;
            }

            status.body.extend_from_slice(&request.payload);
            status.num += 1;

            if b1.more {
                drop(guard);
                let mut cont = Message::respond_to(&request, Code::CONTINUE);
                cont.options.set_block1(b1);
                ctx.send_response_below(at, exchange, cont);
                return;
            }

            // last block: hand the assembled body upward
            let body = std::mem::take(&mut status.body);
            *guard = None;
            drop(guard);
            let mut full = request;
            full.payload = Bytes::from(body);
            exchange.set_current_request(full.clone());
            ctx.forward_receive_request(at, exchange, full);
            return;
        }

        if let Some(b2) = request.options.block2() {
            if b2.num > 0 {
                // follow-up for further blocks of a stored response
                let stored = exchange.response_block_status().lock().as_ref().map(|s| {
                    (s.body.clone(), s.prototype.clone())
                });
                if let Some((body, Some(prototype))) = stored {
                    let szx = b2.szx.min(self.szx);
                    let size = 1usize << (szx + 4);
                    let offset = b2.offset();
                    let num = (offset / size) as u32;
                    let (payload, more) = Self::slice(&body, num, szx);

                    let mut block = Message::respond_to(&request, prototype.code);
                    block.options = prototype.options.clone();
                    block.options.remove(number::OBSERVE);
                    block.payload = payload;
                    block.options.set_block2(BlockOption::new(num, more, szx));
                    ctx.send_response_below(at, exchange, block);
                    return;
                }
                // no stored body: fall through and let the handler
                // regenerate it; send_response slices what it returns
            }
        }

        ctx.forward_receive_request(at, exchange, request);
    }

    fn receive_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        mut response: Message,
    ) {
        // 2.31 acknowledges one request block; push the next one
        if response.code == Code::CONTINUE && response.options.block1().is_some() {
            match Self::next_request_block(exchange) {
                Some(next) => ctx.send_request_below(at, exchange, next),
                None => debug!("continue without pending request blocks"),
            }
            return;
        }

        // a real response ends any outbound request transfer
        if response.options.block1().is_some() {
            exchange.request_block_status().lock().take();
        }

        if let Some(b2) = response.options.block2() {
            let mut guard = exchange.response_block_status().lock();
            let status =
                guard.get_or_insert_with(|| BlockwiseStatus::receiving(b2.szx.min(self.szx)));

            if b2.num != status.num {
                debug!("block2 out of order: got {}, expected {}", b2.num, status.num);
                return;
            }

            status.body.extend_from_slice(&response.payload);
            status.num += 1;

            if b2.more {
                drop(guard);
                // ask for the next block with the original request's options
                if let Some(mut next) = exchange.request() {
                    next.mid = None;
                    next.duplicate = false;
                    next.payload = Bytes::new();
                    next.options.remove(number::OBSERVE);
                    next.options.remove(number::BLOCK1);
                    next.options
                        .set_block2(BlockOption::new(b2.num + 1, false, b2.szx));
                    ctx.send_request_below(at, exchange, next);
                }
                return;
            }

            // transfer complete: deliver the assembled body
            let body = std::mem::take(&mut status.body);
            *guard = None;
            drop(guard);
            response.payload = Bytes::from(body);
            response.options.remove(number::BLOCK2);
            ctx.forward_receive_response(at, exchange, response);
            return;
        }

        ctx.forward_receive_response(at, exchange, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_boundaries() {
        let body = vec![0u8; 100];
        let (first, more) = BlockwiseLayer::slice(&body, 0, 2); // 64-byte blocks
        assert_eq!(first.len(), 64);
        assert!(more);
        let (second, more) = BlockwiseLayer::slice(&body, 1, 2);
        assert_eq!(second.len(), 36);
        assert!(!more);
        let (past, more) = BlockwiseLayer::slice(&body, 2, 2);
        assert!(past.is_empty());
        assert!(!more);
    }

    #[test]
    fn test_block_count_is_ceiling() {
        let layer = BlockwiseLayer::new(&Config::default().with_preferred_block_size(64));
        let body = vec![0u8; 150];
        let mut blocks = 0;
        let mut num = 0;
        loop {
            let (payload, more) = BlockwiseLayer::slice(&body, num, layer.szx);
            assert!(!payload.is_empty());
            blocks += 1;
            if !more {
                break;
            }
            num += 1;
        }
        // ceil(150 / 64) = 3
        assert_eq!(blocks, 3);
    }
}
