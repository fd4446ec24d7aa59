//! Granule Engine
//!
//! The CoAP message-exchange engine: everything between decoded wire
//! messages on one side and logical requests/responses on the other.
//!
//! - response/request matching by `(MID, token)` ([`Matcher`])
//! - duplicate detection for retransmitted confirmables ([`Deduplicator`])
//! - per-message reliability with exponential back-off (the stack's
//!   reliability layer)
//! - the layered protocol stack: Observe, Blockwise, Token, Reliability
//! - the [`Endpoint`] façade pumping datagrams through all of it

pub mod config;
pub mod dedup;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod exchange;
pub mod executor;
pub mod keys;
pub mod layers;
pub mod matcher;

pub use config::{Config, DeduplicatorMode};
pub use dedup::Deduplicator;
pub use endpoint::{Endpoint, RequestHandle};
pub use error::{EngineError, Result};
pub use events::EndpointObserver;
pub use exchange::{Exchange, ObserveRelation, Origin};
pub use executor::{Executor, OrderingKey};
pub use keys::{KeyId, KeyToken, KeyUri};
pub use layers::{Layer, LayerAt, MessageDeliverer, Outbox, Stack, StackContext, StackTop};
pub use matcher::Matcher;
