//! CoAP options: numbers, value encodings, and the ordered option set
//!
//! Options travel on the wire in strictly increasing option-number order;
//! `OptionSet` keeps them in a `BTreeMap` so encoding is ordered for free.
//! Critical options are the odd-numbered ones: a receiver that does not
//! understand a critical option must reject the message.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Registered option numbers (RFC 7252, 7641, 7959)
pub mod number {
    pub const IF_MATCH: u16 = 1;
    pub const URI_HOST: u16 = 3;
    pub const ETAG: u16 = 4;
    pub const IF_NONE_MATCH: u16 = 5;
    pub const OBSERVE: u16 = 6;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const MAX_AGE: u16 = 14;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;
    pub const LOCATION_QUERY: u16 = 20;
    pub const BLOCK2: u16 = 23;
    pub const BLOCK1: u16 = 27;
    pub const SIZE2: u16 = 28;
    pub const PROXY_URI: u16 = 35;
    pub const PROXY_SCHEME: u16 = 39;
    pub const SIZE1: u16 = 60;
}

/// Content-format codes used by the built-in resources
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const LINK_FORMAT: u16 = 40;
    pub const OCTET_STREAM: u16 = 42;
    pub const JSON: u16 = 50;
    pub const CBOR: u16 = 60;
}

/// Observe option register/deregister values (RFC 7641)
pub mod observe {
    pub const REGISTER: u64 = 0;
    pub const DEREGISTER: u64 = 1;
}

/// Critical options are odd-numbered
pub fn is_critical(number: u16) -> bool {
    number & 0x01 != 0
}

/// Unsafe-to-forward options have bit 1 set
pub fn is_unsafe(number: u16) -> bool {
    number & 0x02 != 0
}

/// Option numbers this implementation understands; anything critical
/// outside this set makes the whole message undecodable
pub fn is_recognized(number: u16) -> bool {
    use number::*;
    matches!(
        number,
        IF_MATCH
            | URI_HOST
            | ETAG
            | IF_NONE_MATCH
            | OBSERVE
            | URI_PORT
            | LOCATION_PATH
            | URI_PATH
            | CONTENT_FORMAT
            | MAX_AGE
            | URI_QUERY
            | ACCEPT
            | LOCATION_QUERY
            | BLOCK2
            | BLOCK1
            | SIZE2
            | PROXY_URI
            | PROXY_SCHEME
            | SIZE1
    )
}

/// Repeatable options may occur more than once
pub fn is_repeatable(number: u16) -> bool {
    use number::*;
    matches!(
        number,
        IF_MATCH | ETAG | LOCATION_PATH | URI_PATH | URI_QUERY | LOCATION_QUERY
    )
}

/// Encode a uint option value: big-endian, no leading zero bytes,
/// zero encodes as the empty string
pub fn encode_uint(value: u64) -> Bytes {
    let be = value.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    Bytes::copy_from_slice(&be[skip..])
}

/// Decode a uint option value (up to 8 bytes)
pub fn decode_uint(bytes: &[u8]) -> Result<u64> {
    if bytes.len() > 8 {
        return Err(Error::BadOptionLength {
            number: 0,
            len: bytes.len(),
        });
    }
    let mut value = 0u64;
    for b in bytes {
        value = (value << 8) | u64::from(*b);
    }
    Ok(value)
}

/// A Block1/Block2 option value: `{num, more, szx}` (RFC 7959)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    /// Block number (24 bits)
    pub num: u32,
    /// More blocks follow
    pub more: bool,
    /// Size exponent: block size is `2^(szx + 4)`, szx 0..=6
    pub szx: u8,
}

impl BlockOption {
    pub fn new(num: u32, more: bool, szx: u8) -> Self {
        BlockOption {
            num: num & 0x00ff_ffff,
            more,
            szx: szx & 0x07,
        }
    }

    /// Construct from a byte count, rounding down to the nearest valid size
    pub fn szx_for_size(size: usize) -> u8 {
        match size {
            0..=31 => 0,
            32..=63 => 1,
            64..=127 => 2,
            128..=255 => 3,
            256..=511 => 4,
            512..=1023 => 5,
            _ => 6,
        }
    }

    /// Block size in bytes
    pub fn size(&self) -> usize {
        1 << (self.szx + 4)
    }

    /// Byte offset of this block within the full body
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    pub fn to_uint(&self) -> u64 {
        (u64::from(self.num) << 4) | (u64::from(self.more) << 3) | u64::from(self.szx)
    }

    pub fn from_uint(value: u64) -> Result<Self> {
        if value > 0x0fff_ffff {
            return Err(Error::BadOptionLength {
                number: number::BLOCK2,
                len: 4,
            });
        }
        let szx = (value & 0x07) as u8;
        if szx == 7 {
            // SZX 7 is reserved
            return Err(Error::BadOptionLength {
                number: number::BLOCK2,
                len: 3,
            });
        }
        Ok(BlockOption {
            num: (value >> 4) as u32,
            more: value & 0x08 != 0,
            szx,
        })
    }
}

/// The ordered, possibly-repeating collection of options on a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSet {
    map: BTreeMap<u16, Vec<Bytes>>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Append a raw value for an option number
    pub fn push(&mut self, number: u16, value: impl Into<Bytes>) {
        self.map.entry(number).or_default().push(value.into());
    }

    /// Replace all values of an option number with one raw value
    pub fn set(&mut self, number: u16, value: impl Into<Bytes>) {
        self.map.insert(number, vec![value.into()]);
    }

    /// Set a uint-encoded option
    pub fn set_uint(&mut self, number: u16, value: u64) {
        self.set(number, encode_uint(value));
    }

    pub fn remove(&mut self, number: u16) -> Option<Vec<Bytes>> {
        self.map.remove(&number)
    }

    pub fn contains(&self, number: u16) -> bool {
        self.map.contains_key(&number)
    }

    /// First value for a number, if any
    pub fn first(&self, number: u16) -> Option<&Bytes> {
        self.map.get(&number).and_then(|v| v.first())
    }

    /// All values for a number
    pub fn all(&self, number: u16) -> &[Bytes] {
        self.map.get(&number).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value decoded as uint
    pub fn uint(&self, number: u16) -> Option<u64> {
        self.first(number).and_then(|b| decode_uint(b).ok())
    }

    /// First value decoded as UTF-8, lossy
    pub fn string(&self, number: u16) -> Option<String> {
        self.first(number)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Iterate `(number, value)` pairs in wire order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Bytes)> {
        self.map
            .iter()
            .flat_map(|(num, values)| values.iter().map(move |v| (*num, v)))
    }

    /// Total number of `(number, value)` pairs
    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn block1(&self) -> Option<BlockOption> {
        self.uint(number::BLOCK1)
            .and_then(|v| BlockOption::from_uint(v).ok())
    }

    pub fn block2(&self) -> Option<BlockOption> {
        self.uint(number::BLOCK2)
            .and_then(|v| BlockOption::from_uint(v).ok())
    }

    pub fn set_block1(&mut self, block: BlockOption) {
        self.set_uint(number::BLOCK1, block.to_uint());
    }

    pub fn set_block2(&mut self, block: BlockOption) {
        self.set_uint(number::BLOCK2, block.to_uint());
    }

    pub fn observe(&self) -> Option<u64> {
        self.uint(number::OBSERVE)
    }

    pub fn set_observe(&mut self, value: u64) {
        // 24-bit sequence space
        self.set_uint(number::OBSERVE, value & 0x00ff_ffff);
    }

    /// Uri-Path segments in order
    pub fn uri_path(&self) -> Vec<String> {
        self.all(number::URI_PATH)
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// Uri-Path as a `/`-joined string
    pub fn uri_path_string(&self) -> String {
        self.uri_path().join("/")
    }

    pub fn set_uri_path(&mut self, path: &str) {
        self.remove(number::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.push(number::URI_PATH, Bytes::copy_from_slice(segment.as_bytes()));
        }
    }

    /// Uri-Query parameters in order
    pub fn uri_query(&self) -> Vec<String> {
        self.all(number::URI_QUERY)
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub fn push_uri_query(&mut self, query: &str) {
        self.push(number::URI_QUERY, Bytes::copy_from_slice(query.as_bytes()));
    }

    pub fn content_format(&self) -> Option<u16> {
        self.uint(number::CONTENT_FORMAT).map(|v| v as u16)
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.set_uint(number::CONTENT_FORMAT, u64::from(format));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_encoding() {
        assert_eq!(encode_uint(0).as_ref(), &[] as &[u8]);
        assert_eq!(encode_uint(5).as_ref(), &[5]);
        assert_eq!(encode_uint(0x0123).as_ref(), &[0x01, 0x23]);
        assert_eq!(decode_uint(&[0x01, 0x23]).unwrap(), 0x0123);
        assert_eq!(decode_uint(&[]).unwrap(), 0);
    }

    #[test]
    fn test_block_option_roundtrip() {
        let block = BlockOption::new(42, true, 6);
        assert_eq!(block.size(), 1024);
        assert_eq!(block.offset(), 42 * 1024);
        let decoded = BlockOption::from_uint(block.to_uint()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_block_szx_reserved() {
        assert!(BlockOption::from_uint(0x07).is_err());
    }

    #[test]
    fn test_uri_path_split() {
        let mut opts = OptionSet::new();
        opts.set_uri_path("/sensors/temp");
        assert_eq!(opts.uri_path(), vec!["sensors", "temp"]);
        assert_eq!(opts.uri_path_string(), "sensors/temp");
        assert_eq!(opts.all(number::URI_PATH).len(), 2);
    }

    #[test]
    fn test_wire_order() {
        let mut opts = OptionSet::new();
        opts.set_uint(number::URI_PORT, 5683);
        opts.set(number::URI_HOST, Bytes::from_static(b"example"));
        opts.set_uri_path("a/b");
        let numbers: Vec<u16> = opts.iter().map(|(n, _)| n).collect();
        assert_eq!(
            numbers,
            vec![
                number::URI_HOST,
                number::URI_PORT,
                number::URI_PATH,
                number::URI_PATH
            ]
        );
    }

    #[test]
    fn test_critical_parity() {
        assert!(is_critical(number::URI_PATH));
        assert!(!is_critical(number::CONTENT_FORMAT));
        assert!(is_critical(number::BLOCK2));
    }
}
