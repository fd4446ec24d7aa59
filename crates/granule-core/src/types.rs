//! Protocol primitive types: message type, code, message ID, token

use crate::error::{Error, Result};
use std::fmt;

/// 16-bit message ID used for ACK/RST matching and duplicate detection
pub type MessageId = u16;

/// CoAP message types (2-bit field in the header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Confirmable: retransmitted until acknowledged
    Con = 0,
    /// Non-confirmable: best effort
    Non = 1,
    /// Acknowledgement, may piggyback a response
    Ack = 2,
    /// Reset: peer could not process or does not care
    Rst = 3,
}

impl MessageType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(MessageType::Con),
            1 => Some(MessageType::Non),
            2 => Some(MessageType::Ack),
            3 => Some(MessageType::Rst),
            _ => None,
        }
    }

    /// CON and NON expect the peer to react; ACK and RST never do
    pub fn expects_reply(&self) -> bool {
        matches!(self, MessageType::Con | MessageType::Non)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Con => "CON",
            MessageType::Non => "NON",
            MessageType::Ack => "ACK",
            MessageType::Rst => "RST",
        };
        f.write_str(s)
    }
}

/// Broad classification of a code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// 0.00
    Empty,
    /// 0.01 - 0.31
    Request,
    /// 2.xx, 4.xx, 5.xx
    Response,
    /// 7.xx, reliable-transport signaling
    Signal,
}

/// A CoAP code: 3-bit class dot 5-bit detail, packed in one byte
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);

    // 0.xx requests
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);
    pub const FETCH: Code = Code(0x05);
    pub const PATCH: Code = Code(0x06);
    pub const IPATCH: Code = Code(0x07);

    // 2.xx success
    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const CONTINUE: Code = Code::new(2, 31);

    // 4.xx client errors
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const BAD_OPTION: Code = Code::new(4, 2);
    pub const FORBIDDEN: Code = Code::new(4, 3);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const PRECONDITION_FAILED: Code = Code::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Code = Code::new(4, 15);

    // 5.xx server errors
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const NOT_IMPLEMENTED: Code = Code::new(5, 1);
    pub const BAD_GATEWAY: Code = Code::new(5, 2);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);
    pub const GATEWAY_TIMEOUT: Code = Code::new(5, 4);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1f))
    }

    pub const fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(&self) -> u8 {
        self.0 & 0x1f
    }

    pub fn kind(&self) -> CodeKind {
        match self.class() {
            0 if self.0 == 0 => CodeKind::Empty,
            0 => CodeKind::Request,
            2 | 4 | 5 => CodeKind::Response,
            7 => CodeKind::Signal,
            // 1.xx and 6.xx are reserved; the codec rejects them before
            // a Code of that class can be observed
            _ => CodeKind::Response,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == CodeKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind() == CodeKind::Response
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    pub fn is_error(&self) -> bool {
        self.class() == 4 || self.class() == 5
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Maximum token length on the wire (TKL 9-15 are reserved)
pub const MAX_TOKEN_LENGTH: usize = 8;

/// An opaque 0-8 byte tag matching responses to requests.
///
/// Stored inline; `Token::EMPTY` (length zero) is a valid token and is
/// distinct from "no token assigned yet".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LENGTH],
}

impl Token {
    /// The zero-length token
    pub const EMPTY: Token = Token {
        len: 0,
        bytes: [0; MAX_TOKEN_LENGTH],
    };

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() > MAX_TOKEN_LENGTH {
            return Err(Error::InvalidTokenLength(slice.len()));
        }
        let mut bytes = [0u8; MAX_TOKEN_LENGTH];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Token {
            len: slice.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(")?;
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_class_detail() {
        assert_eq!(Code::CONTENT.class(), 2);
        assert_eq!(Code::CONTENT.detail(), 5);
        assert_eq!(Code::CONTENT.0, 0x45);
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert_eq!(Code::GET.kind(), CodeKind::Request);
        assert_eq!(Code::EMPTY.kind(), CodeKind::Empty);
        assert_eq!(Code::new(7, 2).kind(), CodeKind::Signal);
    }

    #[test]
    fn test_token_bounds() {
        let tok = Token::from_slice(&[0xde, 0xad]).unwrap();
        assert_eq!(tok.as_bytes(), &[0xde, 0xad]);
        assert_eq!(tok.len(), 2);
        assert!(Token::from_slice(&[0u8; 9]).is_err());
        assert!(Token::EMPTY.is_empty());
        assert_ne!(tok, Token::EMPTY);
    }

    #[test]
    fn test_type_expects_reply() {
        assert!(MessageType::Con.expects_reply());
        assert!(MessageType::Non.expects_reply());
        assert!(!MessageType::Ack.expects_reply());
        assert!(!MessageType::Rst.expects_reply());
    }
}
