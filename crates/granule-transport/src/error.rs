//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("channel stopped")]
    Stopped,

    #[error("datagram of {size} bytes exceeds packet size {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("no session for {0}")]
    NoSession(std::net::SocketAddr),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("multicast join failed: {0}")]
    MulticastJoin(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Other(String),
}

#[cfg(feature = "dtls")]
impl From<openssl::error::ErrorStack> for TransportError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        TransportError::HandshakeFailed(e.to_string())
    }
}
