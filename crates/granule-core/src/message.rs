//! In-memory representation of a CoAP message
//!
//! One struct covers requests, responses, empty messages, and signals; the
//! code class discriminates. Constructors cover the common shapes and the
//! accessors expose the option-carried request/response attributes.

use crate::option::{number, observe, OptionSet};
use crate::types::{Code, CodeKind, MessageId, MessageType, Token};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A decoded or to-be-encoded CoAP message
#[derive(Debug, Clone)]
pub struct Message {
    /// CON / NON / ACK / RST
    pub message_type: MessageType,
    /// Request method, response status, 0.00, or 7.xx signal
    pub code: Code,
    /// 16-bit message ID; `None` until assigned by the matcher
    pub mid: Option<MessageId>,
    /// Matching token; `None` until assigned (distinct from `Token::EMPTY`)
    pub token: Option<Token>,
    /// Options in wire order
    pub options: OptionSet,
    /// Payload bytes (empty means no payload marker on the wire)
    pub payload: Bytes,
    /// Where the datagram came from (receive side)
    pub source: Option<SocketAddr>,
    /// Where the datagram goes (send side)
    pub destination: Option<SocketAddr>,
    /// Set by the matcher when the deduplicator has seen this KeyID before
    pub duplicate: bool,
    /// Cooperative cancel flag, shared with the caller's handle
    canceled: Arc<AtomicBool>,
}

impl Message {
    pub fn new(message_type: MessageType, code: Code) -> Self {
        Message {
            message_type,
            code,
            mid: None,
            token: None,
            options: OptionSet::new(),
            payload: Bytes::new(),
            source: None,
            destination: None,
            duplicate: false,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A confirmable request with the given method
    pub fn request(method: Code, confirmable: bool) -> Self {
        let mtype = if confirmable {
            MessageType::Con
        } else {
            MessageType::Non
        };
        Message::new(mtype, method)
    }

    /// A response of the given status; type is chosen by the caller
    /// (ACK for piggyback, CON/NON for separate)
    pub fn response(message_type: MessageType, status: Code) -> Self {
        Message::new(message_type, status)
    }

    /// A piggybacked response to `request`: ACK reusing its MID and token
    pub fn piggybacked(request: &Message, status: Code) -> Self {
        let mut msg = Message::new(MessageType::Ack, status);
        msg.mid = request.mid;
        msg.token = request.token;
        msg.destination = request.source;
        msg
    }

    /// The conventional response shape for `request`: piggybacked ACK for
    /// CON, NON for NON. Reuses the token; a NON response gets a fresh MID
    /// from the matcher later.
    pub fn respond_to(request: &Message, status: Code) -> Self {
        if request.is_confirmable() {
            Message::piggybacked(request, status)
        } else {
            let mut msg = Message::new(MessageType::Non, status);
            msg.token = request.token;
            msg.destination = request.source;
            msg
        }
    }

    /// An empty ACK for `mid`
    pub fn empty_ack(mid: MessageId, destination: SocketAddr) -> Self {
        let mut msg = Message::new(MessageType::Ack, Code::EMPTY);
        msg.mid = Some(mid);
        msg.token = Some(Token::EMPTY);
        msg.destination = Some(destination);
        msg
    }

    /// An RST for `mid`
    pub fn rst(mid: MessageId, destination: SocketAddr) -> Self {
        let mut msg = Message::new(MessageType::Rst, Code::EMPTY);
        msg.mid = Some(mid);
        msg.token = Some(Token::EMPTY);
        msg.destination = Some(destination);
        msg
    }

    /// An RST rejecting `message`
    pub fn reject(message: &Message) -> Option<Self> {
        let mid = message.mid?;
        let destination = message.source?;
        Some(Message::rst(mid, destination))
    }

    /// CoAP ping: empty CON
    pub fn ping(destination: SocketAddr) -> Self {
        let mut msg = Message::new(MessageType::Con, Code::EMPTY);
        msg.token = Some(Token::EMPTY);
        msg.destination = Some(destination);
        msg
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_mid(mut self, mid: MessageId) -> Self {
        self.mid = Some(mid);
        self
    }

    pub fn kind(&self) -> CodeKind {
        self.code.kind()
    }

    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.code.is_response()
    }

    /// Code 0.00: bare ACK, RST, or ping
    pub fn is_empty(&self) -> bool {
        self.kind() == CodeKind::Empty
    }

    pub fn is_confirmable(&self) -> bool {
        self.message_type == MessageType::Con
    }

    /// Observe option with the register value
    pub fn is_observe_register(&self) -> bool {
        self.options.observe() == Some(observe::REGISTER)
    }

    /// Observe option with the deregister value
    pub fn is_observe_deregister(&self) -> bool {
        self.options.observe() == Some(observe::DEREGISTER)
    }

    /// True when the destination is a multicast group address
    pub fn is_multicast(&self) -> bool {
        self.destination
            .map(|addr| addr.ip().is_multicast())
            .unwrap_or(false)
    }

    /// Cooperative cancellation: checked by the stack at layer boundaries
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Handle that cancels this message (and its clones) from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.canceled.clone(),
        }
    }

    /// Token value or the empty token; used when building map keys for
    /// messages that have already passed the token layer
    pub fn token_or_empty(&self) -> Token {
        self.token.unwrap_or(Token::EMPTY)
    }

    /// Uri-Host/Port/Path/Query flattened back into a request URI string
    pub fn request_uri(&self) -> String {
        let mut uri = String::from("/");
        uri.push_str(&self.options.uri_path_string());
        let query = self.options.uri_query();
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query.join("&"));
        }
        uri
    }
}

/// Cancels the message it was taken from
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn test_piggybacked_reuses_mid_and_token() {
        let mut req = Message::request(Code::GET, true);
        req.mid = Some(0x1234);
        req.token = Some(Token::from_slice(&[0xff]).unwrap());
        req.source = Some(addr());

        let resp = Message::piggybacked(&req, Code::CONTENT);
        assert_eq!(resp.message_type, MessageType::Ack);
        assert_eq!(resp.mid, Some(0x1234));
        assert_eq!(resp.token, req.token);
        assert_eq!(resp.destination, Some(addr()));
    }

    #[test]
    fn test_reject_needs_mid_and_source() {
        let mut msg = Message::request(Code::GET, true);
        assert!(Message::reject(&msg).is_none());
        msg.mid = Some(7);
        msg.source = Some(addr());
        let rst = Message::reject(&msg).unwrap();
        assert_eq!(rst.message_type, MessageType::Rst);
        assert_eq!(rst.mid, Some(7));
    }

    #[test]
    fn test_cancel_flag_shared_across_clones() {
        let msg = Message::request(Code::GET, true);
        let clone = msg.clone();
        let handle = msg.cancel_handle();
        handle.cancel();
        assert!(msg.is_canceled());
        assert!(clone.is_canceled());
    }

    #[test]
    fn test_request_uri() {
        let mut req = Message::request(Code::GET, true);
        req.options.set_uri_path("sensors/temp");
        req.options.push_uri_query("unit=c");
        assert_eq!(req.request_uri(), "/sensors/temp?unit=c");
    }
}
