//! Engine error types
//!
//! Per-message faults never cross a layer boundary as panics or results;
//! they travel the exchange failure path and surface to the caller through
//! the exchange's waiter. `EngineError` is what that waiter sees.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// CON retransmits exhausted without ACK/RST/response
    #[error("transmission timed out after {attempts} attempts")]
    TransmissionTimeout { attempts: u32 },

    /// Peer answered with RST
    #[error("rejected by peer")]
    Rejected,

    /// Outgoing URI scheme not served by this endpoint
    #[error("scheme not served by this endpoint: {0}")]
    Schema(String),

    /// The caller canceled the message
    #[error("canceled")]
    Canceled,

    /// Token space exhausted at the configured length
    #[error("could not allocate a unique token")]
    TokenExhausted,

    /// The endpoint is not running or shut down mid-exchange
    #[error("endpoint stopped")]
    Stopped,

    /// Outgoing message has no destination address
    #[error("message has no destination")]
    NoDestination,

    /// Wire-level problem on the send path
    #[error(transparent)]
    Format(#[from] granule_core::Error),

    /// Channel-level problem on the send path
    #[error(transparent)]
    Transport(#[from] granule_transport::TransportError),
}
