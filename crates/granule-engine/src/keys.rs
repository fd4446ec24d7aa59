//! Exchange keys: the three disjoint index spaces of the matcher

use granule_core::{Message, MessageId, Token};
use granule_transport::SessionId;
use std::net::SocketAddr;

/// Identifies a specific wire message under reliability (ACK/RST by ID).
/// `remote` is `None` for locally minted IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId {
    pub mid: MessageId,
    pub remote: Option<SocketAddr>,
    pub session: SessionId,
}

impl KeyId {
    /// Key for an ID this endpoint minted
    pub fn local(mid: MessageId, session: SessionId) -> Self {
        KeyId {
            mid,
            remote: None,
            session,
        }
    }

    /// Key for an ID minted by `remote`
    pub fn remote(mid: MessageId, remote: SocketAddr, session: SessionId) -> Self {
        KeyId {
            mid,
            remote: Some(remote),
            session,
        }
    }
}

/// Identifies the logical owner of a response; tokens are namespaced per
/// endpoint, so the token bytes alone are the key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyToken(pub Token);

/// Identifies a blockwise transfer in progress across multiple request
/// blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyUri {
    pub uri: String,
    pub remote: SocketAddr,
}

impl KeyUri {
    /// Key for a request's target URI and its peer
    pub fn for_request(request: &Message, remote: SocketAddr) -> Self {
        KeyUri {
            uri: request.request_uri(),
            remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granule_core::Code;

    #[test]
    fn test_local_and_remote_ids_are_distinct() {
        let session = SessionId::new();
        let addr: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        assert_ne!(KeyId::local(7, session), KeyId::remote(7, addr, session));
    }

    #[test]
    fn test_key_uri_includes_query() {
        let addr: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let mut req = Message::request(Code::GET, true);
        req.options.set_uri_path("a/b");
        req.options.push_uri_query("x=1");
        let key = KeyUri::for_request(&req, addr);
        assert_eq!(key.uri, "/a/b?x=1");
    }
}
