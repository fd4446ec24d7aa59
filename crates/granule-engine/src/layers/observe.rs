//! Observe layer
//!
//! Server side: responses belonging to an observe relation get the
//! relation's next 24-bit sequence number; an RST aimed at a
//! notification cancels the relation. Relation attach/detach itself is
//! the resource tree's business and happens during request delivery.

use granule_core::{Message, MessageType};
use std::sync::Arc;
use tracing::debug;

use crate::exchange::Exchange;
use crate::layers::{Layer, LayerAt, StackContext};

#[derive(Default)]
pub struct ObserveLayer;

impl ObserveLayer {
    pub fn new() -> Self {
        ObserveLayer
    }
}

impl Layer for ObserveLayer {
    fn send_response(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: &Arc<Exchange>,
        mut response: Message,
    ) {
        if let Some(relation) = exchange.relation() {
            if relation.is_canceled() {
                exchange.remove_relation();
            } else if response.code.is_success() {
                response
                    .options
                    .set_observe(u64::from(relation.next_sequence()));
            }
        }
        ctx.send_response_below(at, exchange, response);
    }

    fn receive_empty(
        &self,
        ctx: &StackContext<'_>,
        at: LayerAt,
        exchange: Option<&Arc<Exchange>>,
        message: Message,
    ) {
        if message.message_type == MessageType::Rst {
            if let Some(relation) = exchange.and_then(|e| e.remove_relation()) {
                debug!("rst from observer, canceling relation");
                relation.cancel();
            }
        }
        ctx.forward_receive_empty(at, exchange, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ObserveRelation;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    pub(crate) struct FakeRelation {
        sequence: AtomicU32,
        canceled: AtomicBool,
    }

    impl FakeRelation {
        pub(crate) fn new() -> Self {
            FakeRelation {
                sequence: AtomicU32::new(2),
                canceled: AtomicBool::new(false),
            }
        }
    }

    impl ObserveRelation for FakeRelation {
        fn next_sequence(&self) -> u32 {
            self.sequence.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff
        }

        fn cancel(&self) {
            self.canceled.store(true, Ordering::Relaxed);
        }

        fn is_canceled(&self) -> bool {
            self.canceled.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn test_fake_relation_sequences() {
        let relation = FakeRelation::new();
        assert_eq!(relation.next_sequence(), 2);
        assert_eq!(relation.next_sequence(), 3);
        assert!(!relation.is_canceled());
        relation.cancel();
        assert!(relation.is_canceled());
    }
}
