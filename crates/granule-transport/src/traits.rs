//! Channel trait definitions
//!
//! A channel is a datagram transport: plain UDP or DTLS over UDP. The
//! engine never touches sockets directly; it consumes `ChannelEvent`s and
//! hands encoded datagrams back to `Channel::send`.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Identifies one secure association (or the single plain-UDP pseudo
/// session of a channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-peer transport session. For plain UDP every peer shares the
/// channel's one unauthenticated session; DTLS mints one per handshake.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// PSK identity the peer authenticated with, if any
    pub psk_identity: Option<String>,
    /// DER certificate the peer presented, if any
    pub peer_certificate: Option<Vec<u8>>,
}

impl Session {
    /// An unauthenticated session
    pub fn plain(id: SessionId) -> Self {
        Session {
            id,
            psk_identity: None,
            peer_certificate: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.psk_identity.is_some() || self.peer_certificate.is_some()
    }
}

/// One received datagram with its addressing context
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub source: SocketAddr,
    pub destination: Option<SocketAddr>,
    pub session: Session,
}

/// Events delivered by a running channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// A datagram arrived
    Data(Datagram),
    /// The channel hit a non-fatal error
    Error(String),
    /// The channel stopped (explicitly or because the socket died)
    Stopped { reason: Option<String> },
}

/// Stream of events from a started channel
pub type ChannelReceiver = mpsc::Receiver<ChannelEvent>;

/// Abstract datagram transport
#[async_trait]
pub trait Channel: Send + Sync {
    /// Bind and start receiving; returns the event stream.
    /// Calling start twice is an error.
    async fn start(&self) -> Result<ChannelReceiver>;

    /// Stop receiving and release the socket
    async fn stop(&self);

    /// Send one datagram. `session` may be `None`, in which case the
    /// channel resolves the peer's session itself.
    async fn send(&self, data: Bytes, session: Option<&Session>, remote: SocketAddr)
        -> Result<()>;

    /// Session for a remote, minting one if the transport is sessionless
    fn session(&self, remote: SocketAddr) -> Session;

    /// Local bound address
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Join a multicast group for receiving
    fn add_multicast_group(&self, group: IpAddr) -> Result<()>;

    /// Datagram transports are unordered and lossy; CoAP semantics rely
    /// on this being false even for DTLS
    fn is_reliable(&self) -> bool {
        false
    }

    /// True for DTLS: drives the endpoint's scheme check
    fn is_secure(&self) -> bool {
        false
    }
}
