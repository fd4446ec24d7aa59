//! RFC 7252 wire codec
//!
//! Message layout:
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Byte 0:     Ver (2 bits, fixed 1) | T (2 bits) | TKL (4 bits)   │
//! │ Byte 1:     Code (3-bit class, 5-bit detail)                    │
//! │ Byte 2-3:   Message ID (uint16 big-endian)                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Token: TKL bytes                                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Options: {delta | length} nibbles + extensions (13/14)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ [0xFF marker, then payload bytes]                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The codec is stateless and bidirectional: `encode(decode(bytes)) == bytes`
//! for every well-formed input (options are already in wire order).

use crate::error::{Error, Result};
use crate::message::Message;
use crate::option::{self, OptionSet};
use crate::types::{Code, CodeKind, MessageType, Token, MAX_TOKEN_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed protocol version
pub const VERSION: u8 = 1;

/// Fixed header size
pub const HEADER_SIZE: usize = 4;

/// Payload marker byte, also the reserved option nibble
const PAYLOAD_MARKER: u8 = 0xff;

/// Decode result, discriminated by code class
#[derive(Debug, Clone)]
pub enum Decoded {
    /// Code 0.01 - 0.31
    Request(Message),
    /// Code class 2, 4, or 5
    Response(Message),
    /// Code 0.00: bare ACK, RST, or ping
    Empty(Message),
    /// Code class 7 (reliable-transport signaling; rejected over datagrams)
    Signal(Message),
}

impl Decoded {
    /// The message regardless of classification
    pub fn into_message(self) -> Message {
        match self {
            Decoded::Request(m) | Decoded::Response(m) | Decoded::Empty(m) | Decoded::Signal(m) => {
                m
            }
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            Decoded::Request(m) | Decoded::Response(m) | Decoded::Empty(m) | Decoded::Signal(m) => {
                m
            }
        }
    }
}

/// Encode a message to wire bytes.
///
/// The message must already carry a MID; a missing token encodes as the
/// empty token only for empty messages (the token layer guarantees every
/// request/response has one by the time it reaches the wire).
pub fn encode(message: &Message) -> Result<Bytes> {
    let mid = message.mid.ok_or(Error::MissingMessageId)?;
    let token = match message.token {
        Some(token) => token,
        None if message.is_empty() => Token::EMPTY,
        None => return Err(Error::MissingToken),
    };

    let mut buf = BytesMut::with_capacity(
        HEADER_SIZE + token.len() + 8 + message.options.len() * 4 + message.payload.len() + 1,
    );

    buf.put_u8((VERSION << 6) | ((message.message_type as u8) << 4) | token.len() as u8);
    buf.put_u8(message.code.0);
    buf.put_u16(mid);
    buf.extend_from_slice(token.as_bytes());

    encode_options(&mut buf, &message.options);

    if !message.payload.is_empty() {
        buf.put_u8(PAYLOAD_MARKER);
        buf.extend_from_slice(&message.payload);
    }

    Ok(buf.freeze())
}

fn encode_options(buf: &mut BytesMut, options: &OptionSet) {
    let mut last_number = 0u16;
    for (number, value) in options.iter() {
        let delta = number - last_number;
        last_number = number;

        let (delta_nibble, delta_ext) = nibble_for(u32::from(delta));
        let (len_nibble, len_ext) = nibble_for(value.len() as u32);

        buf.put_u8((delta_nibble << 4) | len_nibble);
        put_ext(buf, delta_ext);
        put_ext(buf, len_ext);
        buf.extend_from_slice(value);
    }
}

/// Nibble plus optional 1- or 2-byte extension for a delta or length
fn nibble_for(value: u32) -> (u8, Option<OptionExt>) {
    match value {
        0..=12 => (value as u8, None),
        13..=268 => (13, Some(OptionExt::One((value - 13) as u8))),
        _ => (14, Some(OptionExt::Two((value - 269) as u16))),
    }
}

enum OptionExt {
    One(u8),
    Two(u16),
}

fn put_ext(buf: &mut BytesMut, ext: Option<OptionExt>) {
    match ext {
        None => {}
        Some(OptionExt::One(b)) => buf.put_u8(b),
        Some(OptionExt::Two(v)) => buf.put_u16(v),
    }
}

/// Decode wire bytes into a classified message
pub fn decode(bytes: &[u8]) -> Result<Decoded> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::BufferTooSmall {
            needed: HEADER_SIZE,
            have: bytes.len(),
        });
    }

    let version = bytes[0] >> 6;
    if version != VERSION {
        return Err(Error::InvalidVersion(version));
    }

    // 2-bit field, all four values are valid
    let message_type = MessageType::from_u8((bytes[0] >> 4) & 0x03).unwrap();

    let token_length = (bytes[0] & 0x0f) as usize;
    if token_length > MAX_TOKEN_LENGTH {
        return Err(Error::InvalidTokenLength(token_length));
    }

    let code = Code(bytes[1]);
    if code.class() == 1 || code.class() == 6 {
        return Err(Error::ReservedCodeClass(code.class()));
    }

    let mid = u16::from_be_bytes([bytes[2], bytes[3]]);

    // An empty message is exactly four bytes
    if code == Code::EMPTY && (token_length != 0 || bytes.len() > HEADER_SIZE) {
        return Err(Error::NonEmptyEmptyMessage);
    }

    let mut cursor = HEADER_SIZE;
    if bytes.len() < cursor + token_length {
        return Err(Error::BufferTooSmall {
            needed: cursor + token_length,
            have: bytes.len(),
        });
    }
    let token = Token::from_slice(&bytes[cursor..cursor + token_length])?;
    cursor += token_length;

    let (options, payload) = decode_options(&bytes[cursor..])?;

    let mut message = Message::new(message_type, code);
    message.mid = Some(mid);
    message.token = Some(token);
    message.options = options;
    message.payload = payload;

    Ok(match code.kind() {
        CodeKind::Empty => Decoded::Empty(message),
        CodeKind::Request => Decoded::Request(message),
        CodeKind::Response => Decoded::Response(message),
        CodeKind::Signal => Decoded::Signal(message),
    })
}

fn decode_options(mut bytes: &[u8]) -> Result<(OptionSet, Bytes)> {
    let mut options = OptionSet::new();
    let mut number = 0u16;

    while let Some((&first, rest)) = bytes.split_first() {
        if first == PAYLOAD_MARKER {
            if rest.is_empty() {
                return Err(Error::PayloadMarkerWithoutPayload);
            }
            return Ok((options, Bytes::copy_from_slice(rest)));
        }

        let delta_nibble = first >> 4;
        let len_nibble = first & 0x0f;
        if delta_nibble == 15 {
            return Err(Error::ReservedOptionNibble("delta"));
        }
        if len_nibble == 15 {
            return Err(Error::ReservedOptionNibble("length"));
        }

        let mut cursor = rest;
        let delta = read_ext(&mut cursor, delta_nibble)?;
        let length = read_ext(&mut cursor, len_nibble)? as usize;

        let next = u32::from(number) + delta;
        if next > u32::from(u16::MAX) {
            return Err(Error::OptionNumberOverflow);
        }
        number = next as u16;

        if option::is_critical(number) && !option::is_recognized(number) {
            return Err(Error::UnknownCriticalOption(number));
        }

        if cursor.len() < length {
            return Err(Error::TruncatedOption);
        }
        let (value, remaining) = cursor.split_at(length);
        options.push(number, Bytes::copy_from_slice(value));
        bytes = remaining;
    }

    Ok((options, Bytes::new()))
}

/// Resolve a delta/length nibble against its extension bytes
fn read_ext(cursor: &mut &[u8], nibble: u8) -> Result<u32> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let (&b, rest) = cursor.split_first().ok_or(Error::TruncatedOption)?;
            *cursor = rest;
            Ok(u32::from(b) + 13)
        }
        14 => {
            if cursor.len() < 2 {
                return Err(Error::TruncatedOption);
            }
            let v = u16::from_be_bytes([cursor[0], cursor[1]]);
            *cursor = &cursor[2..];
            Ok(u32::from(v) + 269)
        }
        _ => Err(Error::ReservedOptionNibble("delta")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::number;

    fn roundtrip(message: &Message) -> Message {
        let encoded = encode(message).unwrap();
        let decoded = decode(&encoded).unwrap().into_message();
        let reencoded = encode(&decoded).unwrap();
        assert_eq!(encoded, reencoded);
        decoded
    }

    #[test]
    fn test_ping_bytes() {
        // CON, code 0, MID 0x1234: 40 00 12 34
        let ping = Message::ping("127.0.0.1:5683".parse().unwrap()).with_mid(0x1234);
        let encoded = encode(&ping).unwrap();
        assert_eq!(encoded.as_ref(), &[0x40, 0x00, 0x12, 0x34]);

        match decode(&encoded).unwrap() {
            Decoded::Empty(m) => {
                assert_eq!(m.message_type, MessageType::Con);
                assert_eq!(m.mid, Some(0x1234));
            }
            other => panic!("expected empty, got {:?}", other),
        }
    }

    #[test]
    fn test_get_request_bytes() {
        // CON GET /test, MID 1, token ff: 41 01 00 01 FF B4 74 65 73 74
        let mut req = Message::request(Code::GET, true)
            .with_mid(0x0001)
            .with_token(Token::from_slice(&[0xff]).unwrap());
        req.options.set_uri_path("test");

        let encoded = encode(&req).unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0x41, 0x01, 0x00, 0x01, 0xff, 0xb4, b't', b'e', b's', b't']
        );
    }

    #[test]
    fn test_piggyback_response_bytes() {
        // ACK 2.05, MID 1, token ff, payload "hello":
        // 61 45 00 01 FF FF 68 65 6C 6C 6F
        let mut req = Message::request(Code::GET, true)
            .with_mid(0x0001)
            .with_token(Token::from_slice(&[0xff]).unwrap());
        req.source = Some("127.0.0.1:40000".parse().unwrap());
        let resp = Message::piggybacked(&req, Code::CONTENT).with_payload(&b"hello"[..]);

        let encoded = encode(&resp).unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0x61, 0x45, 0x00, 0x01, 0xff, 0xff, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn test_roundtrip_with_options_and_payload() {
        let mut msg = Message::request(Code::POST, true)
            .with_mid(0xbeef)
            .with_token(Token::from_slice(&[1, 2, 3, 4]).unwrap())
            .with_payload(&b"body"[..]);
        msg.options.set(number::URI_HOST, &b"example.org"[..]);
        msg.options.set_uint(number::URI_PORT, 5683);
        msg.options.set_uri_path("a/b/c");
        msg.options.set_content_format(0);
        msg.options.set_uint(number::MAX_AGE, 60);

        let decoded = roundtrip(&msg);
        assert_eq!(decoded.options.uri_path(), vec!["a", "b", "c"]);
        assert_eq!(decoded.options.content_format(), Some(0));
        assert_eq!(decoded.payload.as_ref(), b"body");
    }

    #[test]
    fn test_option_extended_deltas() {
        // Size1 (60) needs a one-byte delta extension; a large value
        // exercises the two-byte length extension
        let mut msg = Message::request(Code::PUT, false)
            .with_mid(1)
            .with_token(Token::EMPTY);
        msg.options.set_uint(number::SIZE1, 1024);
        msg.options
            .set(number::PROXY_URI, Bytes::from(vec![b'x'; 300]));
        roundtrip(&msg);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        assert!(matches!(
            decode(&[0x00, 0x01, 0x00, 0x01]),
            Err(Error::InvalidVersion(0))
        ));
    }

    #[test]
    fn test_decode_rejects_long_tkl() {
        assert!(matches!(
            decode(&[0x49, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::InvalidTokenLength(9))
        ));
    }

    #[test]
    fn test_decode_rejects_nonempty_empty() {
        // code 0 with a payload marker
        assert!(matches!(
            decode(&[0x40, 0x00, 0x12, 0x34, 0xff, 0x01]),
            Err(Error::NonEmptyEmptyMessage)
        ));
    }

    #[test]
    fn test_decode_rejects_marker_without_payload() {
        assert!(matches!(
            decode(&[0x41, 0x01, 0x00, 0x01, 0xaa, 0xff]),
            Err(Error::PayloadMarkerWithoutPayload)
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_critical_option() {
        // option number 9 (critical, unassigned): delta nibble 9, length 0
        assert!(matches!(
            decode(&[0x41, 0x01, 0x00, 0x01, 0xaa, 0x90]),
            Err(Error::UnknownCriticalOption(9))
        ));
    }

    #[test]
    fn test_decode_tolerates_unknown_elective_option() {
        // option number 12 would be Content-Format; use delta 2 from 12
        // to hit 14 (Max-Age, elective, known) then an unknown elective.
        // Unknown elective = number 22: delta 22, len 0 -> nibble 13 ext 9
        let decoded = decode(&[0x41, 0x01, 0x00, 0x01, 0xaa, 0xd0, 0x09]).unwrap();
        let msg = decoded.into_message();
        assert!(msg.options.contains(22));
    }

    #[test]
    fn test_decode_rejects_truncated_option() {
        // length nibble says 5 bytes, only 2 present
        assert!(matches!(
            decode(&[0x41, 0x01, 0x00, 0x01, 0xaa, 0xb5, b'a', b'b']),
            Err(Error::TruncatedOption)
        ));
    }

    #[test]
    fn test_decode_rejects_reserved_code_class() {
        assert!(matches!(
            decode(&[0x40, 0x30, 0x00, 0x01]),
            Err(Error::ReservedCodeClass(1))
        ));
    }
}
