//! Reliability layer
//!
//! Confirmable messages start a retransmit timer drawn from
//! `[ack_timeout, ack_timeout * ack_random_factor]`, doubling on every
//! expiry. The cached datagram bytes are re-sent verbatim. After
//! `max_retransmit` attempts without ACK/RST/response, the exchange
//! fails with `TransmissionTimeout`. Non-confirmables pass through.
//!
//! The receive half also owns duplicate replay: a request flagged as
//! duplicate is answered with the exchange's cached response bytes and
//! never reaches the layers above.

use granule_core::{Message, MessageType};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::EngineError;
use crate::exchange::Exchange;
use crate::executor::OrderingKey;
use crate::layers::{Layer, LayerAt, StackContext};

pub struct ReliabilityLayer;

impl ReliabilityLayer {
    pub fn new(_config: &Config) -> Self {
        ReliabilityLayer
    }

    /// Initial timeout with jitter
    fn initial_timeout(config: &Config) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0..=config.ack_random_factor.max(1.0));
        config.ack_timeout.mul_f64(factor)
    }

    /// Arm the retransmit timer for a CON the outbox just sent
    fn schedule(ctx: &StackContext<'_>, exchange: &Arc<Exchange>) {
        exchange.clear_acknowledged();
        let endpoint = ctx.endpoint.clone();
        let exchange_task = exchange.clone();
        let max_retransmit = ctx.config.max_retransmit;
        let mut timeout = Self::initial_timeout(ctx.config);
        let key = OrderingKey::new(exchange_task.remote(), &[]);

        let task = tokio::spawn(async move {
            let exchange = exchange_task;
            for attempt in 1..=max_retransmit {
                tokio::time::sleep(timeout).await;
                if exchange.is_complete() || exchange.is_acknowledged() {
                    return;
                }
                if exchange
                    .current_request()
                    .map(|r| r.is_canceled())
                    .unwrap_or(false)
                {
                    return;
                }
                debug!(
                    "retransmit attempt {} for {:?} after {:?}",
                    attempt, exchange, timeout
                );
                exchange.next_attempt();
                {
                    let endpoint = endpoint.clone();
                    let exchange = exchange.clone();
                    endpoint.clone().post(
                        key,
                        Box::new(move || endpoint.transmit_cached(&exchange)),
                    );
                }
                timeout = timeout * 2;
            }

            // one final back-off window for the last retransmit to be answered
            tokio::time::sleep(timeout).await;
            if exchange.is_complete() || exchange.is_acknowledged() {
                return;
            }
            let failed = exchange.clone();
            endpoint.clone().post(
                key,
                Box::new(move || {
                    endpoint.fail_exchange(
                        &failed,
                        EngineError::TransmissionTimeout {
                            attempts: max_retransmit,
                        },
                    );
                }),
            );
        });

        exchange.set_retransmission(task);
    }
}

impl Layer for ReliabilityLayer {
    fn send_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        let confirmable = request.is_confirmable() && !request.is_multicast();
        ctx.send_request_below(at, exchange, request);
        if confirmable {
            Self::schedule(ctx, exchange);
        }
    }

    fn send_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        response: Message,
    ) {
        let confirmable = response.is_confirmable();
        ctx.send_response_below(at, exchange, response);
        if confirmable {
            Self::schedule(ctx, exchange);
        }
    }

    fn send_empty(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        // a CON ping is retransmitted like any confirmable
        let confirmable = message.is_confirmable();
        ctx.send_empty_below(at, exchange, message);
        if confirmable {
            if let Some(exchange) = exchange {
                Self::schedule(ctx, exchange);
            }
        }
    }

    fn receive_request(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        request: Message,
    ) {
        if request.duplicate {
            // replay the stored response without re-invoking anything above
            match exchange.last_transmission() {
                Some(transmission) => {
                    trace!("replaying cached response for duplicate {:?}", request.mid);
                    ctx.endpoint.transmit_raw(transmission);
                }
                None => {
                    trace!("duplicate {:?} while still processing, ignoring", request.mid);
                }
            }
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
        // any matching response proves the request arrived
        exchange.set_acknowledged();

        // a separate CON response wants its own ACK, duplicates included
        if response.message_type == MessageType::Con {
            if let (Some(mid), Some(source)) = (response.mid, response.source) {
                let ack = Message::empty_ack(mid, source);
                ctx.send_empty_below(at, Some(exchange), ack);
            }
        }

        if response.duplicate {
            trace!("suppressing duplicate response {:?}", response.mid);
            return;
        }
        ctx.forward_receive_response(at, exchange, response);
    }

    fn receive_empty(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        if let Some(exchange) = exchange {
            match message.message_type {
                MessageType::Ack => {
                    trace!("ack for {:?}", exchange);
                    exchange.set_acknowledged();
                }
                MessageType::Rst => {
                    exchange.cancel_retransmission();
                }
                _ => {}
            }
        }
        ctx.forward_receive_empty(at, exchange, message);
    }
}
