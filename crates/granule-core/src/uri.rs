//! CoAP request URIs
//!
//! `coap://host[:port]/path?query` with `coaps://` for DTLS; the `+udp`
//! suffixed forms are accepted as aliases. The parsed form maps directly
//! onto the Uri-Host / Uri-Port / Uri-Path / Uri-Query options.

use crate::error::{Error, Result};
use crate::option::OptionSet;
use std::fmt;

/// Default port for `coap://`
pub const DEFAULT_PORT: u16 = 5683;

/// Default port for `coaps://`
pub const DEFAULT_SECURE_PORT: u16 = 5684;

/// The URI schemes an endpoint can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain UDP
    Coap,
    /// DTLS-secured UDP
    Coaps,
}

impl Scheme {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "coap" | "coap+udp" => Ok(Scheme::Coap),
            "coaps" | "coaps+udp" => Ok(Scheme::Coaps),
            other => Err(Error::UnknownScheme(other.to_string())),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Coap => DEFAULT_PORT,
            Scheme::Coaps => DEFAULT_SECURE_PORT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Coap => "coap",
            Scheme::Coaps => "coaps",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed CoAP request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path segments without the leading slash
    pub path: Vec<String>,
    /// Query parameters without the leading question mark
    pub query: Vec<String>,
}

impl CoapUri {
    /// Parse a URI string
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme_str, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme: {uri}")))?;
        let scheme = Scheme::parse(scheme_str)?;

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Error::InvalidUri(format!("missing host: {uri}")));
        }

        // IPv6 literals are bracketed
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::InvalidUri(format!("unterminated ipv6 literal: {uri}")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, uri)?,
                None if tail.is_empty() => scheme.default_port(),
                None => return Err(Error::InvalidUri(format!("junk after host: {uri}"))),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host.to_string(), parse_port(p, uri)?),
                None => (authority.to_string(), scheme.default_port()),
            }
        };

        let (path_str, query_str) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };

        let path = path_str
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let query = query_str
            .map(|q| q.split('&').filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        Ok(CoapUri {
            scheme,
            host,
            port,
            path,
            query,
        })
    }

    /// Fill the Uri-* options of an outgoing request
    pub fn apply_to(&self, options: &mut OptionSet) {
        use crate::option::number;

        // Literal IP addresses omit Uri-Host (it only names virtual hosts)
        if self.host.parse::<std::net::IpAddr>().is_err() {
            options.set(number::URI_HOST, self.host.clone().into_bytes());
        }
        if self.port != self.scheme.default_port() {
            options.set_uint(number::URI_PORT, u64::from(self.port));
        }
        options.remove(number::URI_PATH);
        for segment in &self.path {
            options.push(number::URI_PATH, segment.clone().into_bytes());
        }
        options.remove(number::URI_QUERY);
        for q in &self.query {
            options.push(number::URI_QUERY, q.clone().into_bytes());
        }
    }

    /// `host:port` for address resolution
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for CoapUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if self.port != self.scheme.default_port() {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "/{}", self.path.join("/"))?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query.join("&"))?;
        }
        Ok(())
    }
}

fn parse_port(p: &str, uri: &str) -> Result<u16> {
    p.parse()
        .map_err(|_| Error::InvalidUri(format!("bad port: {uri}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let uri = CoapUri::parse("coap://example.org/sensors/temp?unit=c").unwrap();
        assert_eq!(uri.scheme, Scheme::Coap);
        assert_eq!(uri.host, "example.org");
        assert_eq!(uri.port, 5683);
        assert_eq!(uri.path, vec!["sensors", "temp"]);
        assert_eq!(uri.query, vec!["unit=c"]);
    }

    #[test]
    fn test_parse_secure_and_aliases() {
        assert_eq!(
            CoapUri::parse("coaps://host/x").unwrap().port,
            DEFAULT_SECURE_PORT
        );
        assert_eq!(
            CoapUri::parse("coap+udp://host/x").unwrap().scheme,
            Scheme::Coap
        );
        assert_eq!(
            CoapUri::parse("coaps+udp://host/x").unwrap().scheme,
            Scheme::Coaps
        );
    }

    #[test]
    fn test_parse_explicit_port_and_ipv6() {
        let uri = CoapUri::parse("coap://10.0.0.1:1234/a").unwrap();
        assert_eq!(uri.port, 1234);

        let uri = CoapUri::parse("coap://[::1]:7777/a/b").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 7777);
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(matches!(
            CoapUri::parse("http://example.org/"),
            Err(Error::UnknownScheme(_))
        ));
    }

    #[test]
    fn test_apply_skips_host_for_literals() {
        use crate::option::number;

        let uri = CoapUri::parse("coap://192.168.1.5/led").unwrap();
        let mut opts = OptionSet::new();
        uri.apply_to(&mut opts);
        assert!(!opts.contains(number::URI_HOST));
        assert_eq!(opts.uri_path(), vec!["led"]);

        let uri = CoapUri::parse("coap://node.local/led").unwrap();
        let mut opts = OptionSet::new();
        uri.apply_to(&mut opts);
        assert_eq!(opts.string(number::URI_HOST).as_deref(), Some("node.local"));
    }

    #[test]
    fn test_display_roundtrip() {
        let s = "coap://example.org/a/b?x=1&y=2";
        assert_eq!(CoapUri::parse(s).unwrap().to_string(), s);
    }
}
