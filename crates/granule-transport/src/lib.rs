//! Granule Transport Layer
//!
//! Datagram channels for the Granule CoAP stack. CoAP rides on unreliable
//! datagrams; the engine supplies its own reliability, so a channel only
//! moves bytes and tracks per-peer sessions.
//!
//! Available channels:
//! - UDP (default)
//! - DTLS over UDP (feature `dtls`, openssl-backed)

pub mod error;
pub mod traits;
pub mod udp;

#[cfg(feature = "dtls")]
pub mod dtls;

pub use error::{Result, TransportError};
pub use traits::{Channel, ChannelEvent, ChannelReceiver, Datagram, Session, SessionId};
pub use udp::{UdpChannel, UdpConfig};

#[cfg(feature = "dtls")]
pub use dtls::{DtlsChannel, DtlsConfig};
