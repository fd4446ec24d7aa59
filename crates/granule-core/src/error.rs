//! Error types for granule-core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Datagram shorter than the fixed header
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// Version bits were not 1
    #[error("unsupported version: {0}")]
    InvalidVersion(u8),

    /// Token length nibble above 8
    #[error("invalid token length: {0}")]
    InvalidTokenLength(usize),

    /// Empty (code 0.00) message carrying token, options, or payload
    #[error("empty message with non-empty body")]
    NonEmptyEmptyMessage,

    /// Reserved option nibble 15 outside the payload marker
    #[error("reserved option nibble in {0} field")]
    ReservedOptionNibble(&'static str),

    /// Option header ran past the end of the datagram
    #[error("truncated option")]
    TruncatedOption,

    /// Accumulated option number left the 16-bit space
    #[error("option number overflow")]
    OptionNumberOverflow,

    /// A critical option this implementation does not know
    #[error("unknown critical option: {0}")]
    UnknownCriticalOption(u16),

    /// 0xFF marker followed by zero payload bytes
    #[error("payload marker without payload")]
    PayloadMarkerWithoutPayload,

    /// Code class that cannot appear on the wire (1.xx, 6.xx)
    #[error("reserved code class: {0}")]
    ReservedCodeClass(u8),

    /// Option value outside the length bounds for its number
    #[error("bad length {len} for option {number}")]
    BadOptionLength { number: u16, len: usize },

    /// Encode called before the matcher assigned an ID
    #[error("message has no id assigned")]
    MissingMessageId,

    /// Encode called before the token layer assigned a token
    #[error("message has no token assigned")]
    MissingToken,

    /// URI did not parse as a CoAP request target
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// URI scheme is not a CoAP scheme
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),

    /// Link-format input violated the attribute rules
    #[error("link format: {0}")]
    LinkFormat(String),

    /// Attribute that must occur once appeared again (strict mode)
    #[error("link format: repeated attribute {0:?}")]
    RepeatedAttribute(String),
}
