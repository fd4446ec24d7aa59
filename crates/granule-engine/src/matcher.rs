//! Identifier matching
//!
//! The matcher owns the three key-indexed tables that associate wire
//! identifiers with logical exchanges:
//! - `by_id`: MID-keyed, for ACK/RST matching and response correlation
//! - `by_token`: token-keyed, the logical owner of a response
//! - `ongoing_blockwise`: URI-keyed, routes successive request blocks of
//!   one transfer to the same exchange
//!
//! plus the deduplicator. Completion is an explicit hook: whoever flips an
//! exchange to complete calls [`Matcher::complete`] to drop its table
//! entries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use granule_core::{option, Code, Message, MessageType, Token};
use granule_transport::SessionId;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::{EngineError, Result};
use crate::exchange::{Exchange, Origin};
use crate::keys::{KeyId, KeyToken, KeyUri};

pub struct Matcher {
    by_id: DashMap<KeyId, Arc<Exchange>>,
    by_token: DashMap<KeyToken, Arc<Exchange>>,
    ongoing_blockwise: DashMap<KeyUri, Arc<Exchange>>,
    dedup: Deduplicator,
    next_mid: AtomicU32,
    token_length: i8,
    rng: Mutex<StdRng>,
}

impl Matcher {
    pub fn new(config: &Config) -> Self {
        let mut rng = StdRng::from_entropy();
        let mid_start = if config.use_random_mid_start {
            u32::from(rng.gen::<u16>())
        } else {
            0
        };
        Matcher {
            by_id: DashMap::new(),
            by_token: DashMap::new(),
            ongoing_blockwise: DashMap::new(),
            dedup: Deduplicator::from_config(config),
            next_mid: AtomicU32::new(mid_start),
            token_length: config.token_length,
            rng: Mutex::new(rng),
        }
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    fn next_mid(&self) -> u16 {
        (self.next_mid.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16
    }

    /// Claim a token nobody else is using. Starts at the configured
    /// length and grows toward 8 bytes after repeated collisions.
    fn claim_token(&self, exchange: &Arc<Exchange>) -> Result<Token> {
        let base_length = if self.token_length < 0 {
            self.rng.lock().gen_range(1..=8usize)
        } else {
            (self.token_length as usize).min(8)
        };

        for length in base_length..=8 {
            for _ in 0..8 {
                let mut bytes = [0u8; 8];
                self.rng.lock().fill_bytes(&mut bytes[..length.max(1)]);
                let token = Token::from_slice(&bytes[..length])?;
                match self.by_token.entry(KeyToken(token)) {
                    Entry::Occupied(_) => continue,
                    Entry::Vacant(vacant) => {
                        vacant.insert(exchange.clone());
                        *exchange.token_key.lock() = Some(KeyToken(token));
                        return Ok(token);
                    }
                }
            }
        }
        Err(EngineError::TokenExhausted)
    }

    // --- send paths ---

    /// Register an outgoing request: assign MID and token, install the
    /// `by_id` and `by_token` entries.
    pub fn send_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Message,
        session: SessionId,
    ) -> Result<()> {
        if request.mid.is_none() {
            request.mid = Some(self.next_mid());
        }
        match request.token {
            None => {
                request.token = Some(self.claim_token(exchange)?);
            }
            Some(token) => {
                // A caller-set token takes the mapping over deliberately;
                // observe deregistration re-uses the relation's token.
                self.by_token.insert(KeyToken(token), exchange.clone());
                *exchange.token_key.lock() = Some(KeyToken(token));
            }
        }

        let key = KeyId::local(request.mid.unwrap(), session);
        // follow-up blocks of one exchange re-register under a fresh MID
        if let Some(old) = exchange.id_key.lock().replace(key) {
            if old != key {
                self.by_id.remove(&old);
            }
        }
        self.by_id.insert(key, exchange.clone());

        exchange.set_request(request.clone());
        exchange.set_current_request(request.clone());
        trace!("registered outgoing request {:?} token {}", key, request.token_or_empty());
        Ok(())
    }

    /// Register an outgoing response. Returns true when the exchange
    /// completed (caller already ran the completion hook).
    pub fn send_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Message,
        session: SessionId,
    ) -> bool {
        if response.token.is_none() {
            response.token = exchange.current_request().and_then(|r| r.token);
        }
        if response.mid.is_none() {
            match response.message_type {
                // an ACK answers the request's MID
                MessageType::Ack => {
                    response.mid = exchange.current_request().and_then(|r| r.mid);
                }
                _ => response.mid = Some(self.next_mid()),
            }
        }

        let is_notification = response.options.contains(option::number::OBSERVE);

        // Blockwise responses stay addressable by URI for follow-up
        // blocks; observe notifications only carry the first block and
        // are never stored as ongoing.
        if response.options.block2().is_some() {
            if let (Some(request), Some(remote)) =
                (exchange.current_request(), response.destination)
            {
                let key = KeyUri::for_request(&request, remote);
                if is_notification {
                    self.ongoing_blockwise.remove(&key);
                } else {
                    *exchange.uri_key.lock() = Some(key.clone());
                    self.ongoing_blockwise.insert(key, exchange.clone());
                }
            }
        }

        // CON/NON responses can draw an ACK or RST by MID
        if response.message_type.expects_reply() {
            if let Some(mid) = response.mid {
                let key = KeyId::local(mid, session);
                if let Some(old) = exchange.response_id_key.lock().replace(key) {
                    if old != key {
                        self.by_id.remove(&old);
                    }
                }
                self.by_id.insert(key, exchange.clone());
            }
        }

        exchange.set_current_response(response.clone());

        let has_more_blocks = response
            .options
            .block2()
            .map(|b| b.more)
            .unwrap_or(false);
        let is_final = response.code != Code::CONTINUE && !has_more_blocks && !is_notification;

        // ACK and NON responses end the exchange here; a CON response
        // completes when the peer's ACK arrives
        if is_final && response.message_type != MessageType::Con && exchange.set_complete() {
            self.complete(exchange);
            return true;
        }
        false
    }

    /// Register an outgoing empty message. An RST tied to an exchange
    /// completes it; a CON ping registers by MID so the pong (RST) can
    /// be matched back.
    pub fn send_empty(
        &self,
        exchange: Option<&Arc<Exchange>>,
        message: &mut Message,
        session: SessionId,
    ) {
        if message.mid.is_none() {
            message.mid = Some(self.next_mid());
        }
        match message.message_type {
            MessageType::Rst => {
                if let Some(exchange) = exchange {
                    if exchange.set_complete() {
                        self.complete(exchange);
                    }
                }
            }
            MessageType::Con => {
                if let (Some(exchange), Some(mid)) = (exchange, message.mid) {
                    let key = KeyId::local(mid, session);
                    self.by_id.insert(key, exchange.clone());
                    *exchange.id_key.lock() = Some(key);
                }
            }
            _ => {}
        }
    }

    // --- receive paths ---

    /// Route an inbound request to its exchange, creating one for a new
    /// conversation. Duplicates are flagged on the message.
    pub fn receive_request(&self, request: &mut Message, session: SessionId) -> Arc<Exchange> {
        let source = request.source.expect("inbound request carries a source");
        let key_id = KeyId::remote(request.mid.expect("decoded request carries a mid"), source, session);

        let has_block = request.options.block1().is_some() || request.options.block2().is_some();
        if !has_block {
            let fresh = Exchange::from_remote_request(request, session);
            return match self.dedup.find_previous(key_id, &fresh) {
                None => fresh,
                Some(previous) => {
                    debug!("duplicate request {:?}", key_id);
                    request.duplicate = true;
                    previous
                }
            };
        }

        // Blockwise: successive blocks of one transfer share the URI key
        let key_uri = KeyUri::for_request(request, source);
        if let Some(ongoing) = self.ongoing_blockwise.get(&key_uri).map(|e| e.clone()) {
            if self.dedup.find_previous(key_id, &ongoing).is_some() {
                debug!("duplicate request block {:?}", key_id);
                request.duplicate = true;
            } else {
                // a new request block ends the previous response cycle
                if let Some(old_key) = ongoing.response_id_key.lock().take() {
                    self.by_id.remove(&old_key);
                }
                ongoing.set_current_request(request.clone());
            }
            return ongoing;
        }

        let fresh = Exchange::from_remote_request(request, session);
        match self.dedup.find_previous(key_id, &fresh) {
            None => {
                *fresh.uri_key.lock() = Some(key_uri.clone());
                self.ongoing_blockwise.insert(key_uri, fresh.clone());
                fresh
            }
            Some(previous) => {
                request.duplicate = true;
                previous
            }
        }
    }

    /// Match an inbound response to the exchange that owns its token.
    /// `None` means unmatchable; the endpoint rejects non-ACKs with RST.
    pub fn receive_response(
        &self,
        response: &mut Message,
        session: SessionId,
    ) -> Option<Arc<Exchange>> {
        let source = response.source?;
        let mid = response.mid?;
        // An ACK's MID refers to the ID this endpoint minted
        let key_id = match response.message_type {
            MessageType::Ack => KeyId::local(mid, session),
            _ => KeyId::remote(mid, source, session),
        };
        let token = response.token?;

        if let Some(owner) = self.by_token.get(&KeyToken(token)).map(|e| e.clone()) {
            // each multicast reply is a separate logical exchange
            let exchange = if owner.request().map(|r| r.is_multicast()).unwrap_or(false) {
                owner.clone_for_reply()
            } else {
                owner
            };

            if self.dedup.find_previous(key_id, &exchange).is_some() {
                response.duplicate = true;
            } else if let Some(request_key) = exchange.id_key.lock().take() {
                // we have our answer; the request MID no longer matters
                self.by_id.remove(&request_key);
            }

            if response.message_type == MessageType::Ack {
                let request_mid = exchange.current_request().and_then(|r| r.mid);
                if request_mid != Some(mid) {
                    warn!(
                        "possible mid reuse before lifetime end: ack {} for request {:?}",
                        mid, request_mid
                    );
                }
            }
            return Some(exchange);
        }

        if response.message_type != MessageType::Ack {
            // the exchange may have completed already; replay detection
            // falls back to the dedup window
            if let Some(previous) = self.dedup.find(&key_id) {
                response.duplicate = true;
                return Some(previous);
            }
        }
        None
    }

    /// Match an inbound bare ACK/RST to the CON it answers. Terminal for
    /// the `by_id` entry either way.
    pub fn receive_empty(&self, message: &Message, session: SessionId) -> Option<Arc<Exchange>> {
        let mid = message.mid?;
        let key = KeyId::local(mid, session);
        match self.by_id.remove(&key) {
            Some((_, exchange)) => Some(exchange),
            None => {
                trace!("unmatchable empty message mid {}, dropping", mid);
                None
            }
        }
    }

    // --- completion hook ---

    /// Drop an exchange's table entries. Invoked by whoever transitions
    /// the exchange to complete (explicit form of the completion hook).
    pub fn complete(&self, exchange: &Arc<Exchange>) {
        match exchange.origin() {
            Origin::Local => {
                if let Some(key) = exchange.token_key.lock().take() {
                    // the token may have been taken over by a newer
                    // exchange; only drop our own mapping
                    self.by_token
                        .remove_if(&key, |_, owner| Arc::ptr_eq(owner, exchange));
                }
                if let Some(key) = exchange.id_key.lock().take() {
                    self.by_id.remove(&key);
                }
            }
            Origin::Remote => {
                if let Some(key) = exchange.response_id_key.lock().take() {
                    self.by_id.remove(&key);
                }
                if let Some(key) = exchange.uri_key.lock().take() {
                    self.ongoing_blockwise.remove(&key);
                }
            }
        }
    }

    /// Evict blockwise transfers whose partial bodies exceeded their
    /// lifetime
    pub fn evict_stale_blockwise(&self, max_age: std::time::Duration) {
        let stale: Vec<KeyUri> = self
            .ongoing_blockwise
            .iter()
            .filter(|entry| entry.value().blockwise_expired(max_age))
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            debug!("evicting stale blockwise transfer {:?}", key);
            if let Some((_, exchange)) = self.ongoing_blockwise.remove(&key) {
                exchange.request_block_status().lock().take();
                exchange.response_block_status().lock().take();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding_tokens(&self) -> usize {
        self.by_token.len()
    }

    #[cfg(test)]
    pub(crate) fn outstanding_ids(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn local_exchange(session: SessionId) -> Arc<Exchange> {
        Arc::new(Exchange::new(Origin::Local, addr(), session))
    }

    fn inbound_get(mid: u16, token: &[u8]) -> Message {
        let mut req = Message::request(Code::GET, true)
            .with_mid(mid)
            .with_token(Token::from_slice(token).unwrap());
        req.source = Some(addr());
        req.options.set_uri_path("test");
        req
    }

    #[test]
    fn test_send_request_assigns_mid_and_token() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let exchange = local_exchange(session);
        let mut request = Message::request(Code::GET, true);
        request.destination = Some(addr());

        matcher.send_request(&exchange, &mut request, session).unwrap();
        assert!(request.mid.is_some());
        assert_eq!(request.token.unwrap().len(), 8);
        assert_eq!(matcher.outstanding_tokens(), 1);
        assert_eq!(matcher.outstanding_ids(), 1);
    }

    #[test]
    fn test_preset_token_takes_over_mapping() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let first = local_exchange(session);
        let second = local_exchange(session);
        let token = Token::from_slice(&[0x07]).unwrap();

        let mut req1 = Message::request(Code::GET, true).with_token(token);
        req1.destination = Some(addr());
        matcher.send_request(&first, &mut req1, session).unwrap();

        // a deliberate re-use (observe deregistration) replaces the owner
        let mut req2 = Message::request(Code::GET, true).with_token(token);
        req2.destination = Some(addr());
        matcher.send_request(&second, &mut req2, session).unwrap();
        assert_eq!(matcher.outstanding_tokens(), 1);

        // completing the old exchange must not evict the new owner
        first.set_complete();
        matcher.complete(&first);
        assert_eq!(matcher.outstanding_tokens(), 1);
    }

    #[test]
    fn test_generated_tokens_never_collide_live() {
        let matcher = Matcher::new(&Config::default().with_token_length(1));
        let session = SessionId::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let exchange = local_exchange(session);
            let mut req = Message::request(Code::GET, true);
            req.destination = Some(addr());
            matcher.send_request(&exchange, &mut req, session).unwrap();
            assert!(seen.insert(req.token.unwrap()));
        }
    }

    #[test]
    fn test_completion_releases_keys() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let exchange = local_exchange(session);
        let mut request = Message::request(Code::GET, true);
        request.destination = Some(addr());
        matcher.send_request(&exchange, &mut request, session).unwrap();

        exchange.set_complete();
        matcher.complete(&exchange);
        assert_eq!(matcher.outstanding_tokens(), 0);
        assert_eq!(matcher.outstanding_ids(), 0);
    }

    #[test]
    fn test_receive_request_duplicate_detection() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();

        let mut first = inbound_get(0x0001, &[0xff]);
        let exchange = matcher.receive_request(&mut first, session);
        assert!(!first.duplicate);

        let mut again = inbound_get(0x0001, &[0xff]);
        let same = matcher.receive_request(&mut again, session);
        assert!(again.duplicate);
        assert!(Arc::ptr_eq(&exchange, &same));
    }

    #[test]
    fn test_receive_response_matches_token_and_clears_id() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let exchange = local_exchange(session);
        let mut request = Message::request(Code::GET, true);
        request.destination = Some(addr());
        matcher.send_request(&exchange, &mut request, session).unwrap();

        let mut response = Message::response(MessageType::Ack, Code::CONTENT)
            .with_mid(request.mid.unwrap())
            .with_token(request.token.unwrap());
        response.source = Some(addr());

        let matched = matcher.receive_response(&mut response, session).unwrap();
        assert!(Arc::ptr_eq(&matched, &exchange));
        assert!(!response.duplicate);
        // the request's by_id entry is gone once the answer arrived
        assert_eq!(matcher.outstanding_ids(), 0);
    }

    #[test]
    fn test_receive_response_unmatched_is_none() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let mut response = Message::response(MessageType::Non, Code::CONTENT)
            .with_mid(0xabcd)
            .with_token(Token::from_slice(&[0x07]).unwrap());
        response.source = Some(addr());
        assert!(matcher.receive_response(&mut response, session).is_none());
    }

    #[test]
    fn test_receive_empty_removes_entry() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let exchange = local_exchange(session);
        let mut request = Message::request(Code::GET, true);
        request.destination = Some(addr());
        matcher.send_request(&exchange, &mut request, session).unwrap();

        let ack = Message::empty_ack(request.mid.unwrap(), addr());
        let matched = matcher.receive_empty(&ack, session).unwrap();
        assert!(Arc::ptr_eq(&matched, &exchange));
        assert!(matcher.receive_empty(&ack, session).is_none());
    }

    #[test]
    fn test_piggyback_response_completes_remote_exchange() {
        let matcher = Matcher::new(&Config::default());
        let session = SessionId::new();
        let mut request = inbound_get(0x0002, &[0x01]);
        let exchange = matcher.receive_request(&mut request, session);

        let mut response = Message::piggybacked(&request, Code::CONTENT);
        let completed = matcher.send_response(&exchange, &mut response, session);
        assert!(completed);
        assert!(exchange.is_complete());
        assert_eq!(response.mid, Some(0x0002));
        assert_eq!(response.token, request.token);
    }

    #[test]
    fn test_mid_wraps_at_u16() {
        let mut config = Config::default();
        config.use_random_mid_start = false;
        let matcher = Matcher::new(&config);
        matcher.next_mid.store(0xffff, Ordering::Relaxed);
        assert_eq!(matcher.next_mid(), 0xffff);
        assert_eq!(matcher.next_mid(), 0x0000);
    }
}
