//! Granule Core
//!
//! Core types and codecs for the Granule CoAP stack (RFC 7252).
//!
//! This crate provides:
//! - Protocol primitives ([`MessageType`], [`Code`], [`Token`])
//! - The in-memory message model ([`Message`], [`OptionSet`])
//! - The wire codec ([`codec::encode`], [`codec::decode`])
//! - CoAP URIs ([`CoapUri`]) and RFC 6690 link-format ([`link_format`])

pub mod codec;
pub mod error;
pub mod link_format;
pub mod message;
pub mod option;
pub mod types;
pub mod uri;

pub use codec::Decoded;
pub use error::{Error, Result};
pub use message::{CancelHandle, Message};
pub use option::{BlockOption, OptionSet};
pub use types::{Code, CodeKind, MessageId, MessageType, Token, MAX_TOKEN_LENGTH};
pub use uri::{CoapUri, Scheme};

/// Fixed CoAP version number
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for `coap://`
pub const DEFAULT_PORT: u16 = uri::DEFAULT_PORT;

/// Default port for `coaps://`
pub const DEFAULT_SECURE_PORT: u16 = uri::DEFAULT_SECURE_PORT;

/// "All CoAP Nodes" IPv4 multicast group (RFC 7252 §12.8)
pub const ALL_COAP_NODES_V4: std::net::Ipv4Addr = std::net::Ipv4Addr::new(224, 0, 1, 187);
