//! RFC 6690 link-format serialization
//!
//! Resources are advertised at `/.well-known/core` as a comma-separated
//! list of `<uri>;attr=value;...` items. Attribute rules:
//! - `rt`, `rev`, `if`, `rel` take space-separated multi-values
//! - `title`, `sz`, `obs` may appear at most once per link
//! - numeric values are unquoted, everything else is double-quoted
//!
//! Parsing is strict (single-occurrence enforced) or lenient.

use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Attributes that take space-separated multi-values
const MULTI_VALUE: &[&str] = &["rt", "rev", "if", "rel"];

/// Attributes that must occur at most once per link
const SINGLE_OCCURRENCE: &[&str] = &["title", "sz", "obs"];

/// Parsing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Enforce single-occurrence rules
    #[default]
    Strict,
    /// Keep the first occurrence, ignore violations
    Lenient,
}

/// One attribute on a web link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAttribute {
    pub name: String,
    /// `None` for flag attributes like `obs`
    pub value: Option<String>,
}

/// One `<uri>;...` item
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WebLink {
    pub uri: String,
    pub attributes: Vec<LinkAttribute>,
}

impl WebLink {
    pub fn new(uri: impl Into<String>) -> Self {
        WebLink {
            uri: uri.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Option<&str>) -> Self {
        self.attributes.push(LinkAttribute {
            name: name.to_string(),
            value: value.map(str::to_string),
        });
        self
    }

    /// First value of a named attribute
    pub fn attribute(&self, name: &str) -> Option<&LinkAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.attributes
            .iter()
            .any(|a| a.name == name && a.value.is_none())
    }
}

/// Serialize links to the wire representation
pub fn serialize(links: &[WebLink]) -> String {
    let mut out = String::new();
    for (i, link) in links.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "<{}>", link.uri);
        for attr in &link.attributes {
            out.push(';');
            out.push_str(&attr.name);
            if let Some(value) = &attr.value {
                out.push('=');
                if is_numeric(value) {
                    out.push_str(value);
                } else {
                    let _ = write!(out, "\"{}\"", value);
                }
            }
        }
    }
    out
}

/// Parse the wire representation into links
pub fn parse(input: &str, mode: ParseMode) -> Result<Vec<WebLink>> {
    let mut links = Vec::new();
    let mut scanner = Scanner::new(input);

    while !scanner.at_end() {
        links.push(parse_link(&mut scanner, mode)?);
        if !scanner.at_end() {
            scanner.expect(',')?;
        }
    }

    Ok(links)
}

fn parse_link(scanner: &mut Scanner<'_>, mode: ParseMode) -> Result<WebLink> {
    scanner.expect('<')?;
    let uri = scanner.take_until('>')?;
    scanner.expect('>')?;

    let mut link = WebLink::new(uri);
    let mut seen_single: Vec<String> = Vec::new();

    while scanner.peek() == Some(';') {
        scanner.expect(';')?;
        let name = scanner.take_while(|c| c != '=' && c != ';' && c != ',')?;
        if name.is_empty() {
            return Err(Error::LinkFormat("empty attribute name".to_string()));
        }

        let value = if scanner.peek() == Some('=') {
            scanner.expect('=')?;
            Some(scanner.take_value()?)
        } else {
            None
        };

        if SINGLE_OCCURRENCE.contains(&name.as_str()) {
            if seen_single.iter().any(|s| s == &name) {
                match mode {
                    ParseMode::Strict => return Err(Error::RepeatedAttribute(name)),
                    ParseMode::Lenient => continue,
                }
            }
            seen_single.push(name.clone());
        }

        link.attributes.push(LinkAttribute { name, value });
    }

    Ok(link)
}

/// Split a multi-valued attribute (`rt`, `if`, ...) into its parts
pub fn split_multi_value(attr: &LinkAttribute) -> Vec<&str> {
    if !MULTI_VALUE.contains(&attr.name.as_str()) {
        return attr.value.as_deref().into_iter().collect();
    }
    attr.value
        .as_deref()
        .map(|v| v.split(' ').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Minimal character scanner over the input
struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Scanner { input, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += c.len_utf8();
                Ok(())
            }
            found => Err(Error::LinkFormat(format!(
                "expected {:?} at offset {}, found {:?}",
                c, self.pos, found
            ))),
        }
    }

    fn take_until(&mut self, stop: char) -> Result<String> {
        let rest = &self.input[self.pos..];
        match rest.find(stop) {
            Some(idx) => {
                self.pos += idx;
                Ok(rest[..idx].to_string())
            }
            None => Err(Error::LinkFormat(format!("unterminated, wanted {:?}", stop))),
        }
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> Result<String> {
        let rest = &self.input[self.pos..];
        let end = rest
            .char_indices()
            .find(|(_, c)| !keep(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    /// A quoted string or a bare token
    fn take_value(&mut self) -> Result<String> {
        if self.peek() == Some('"') {
            self.expect('"')?;
            let value = self.take_until('"')?;
            self.expect('"')?;
            Ok(value)
        } else {
            self.take_while(|c| c != ';' && c != ',')
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_links() {
        let input =
            "</sensors/temp>;rt=\"temperature\";if=\"sensor\";obs,</sensors/hum>;rt=\"humidity\"";
        let links = parse(input, ParseMode::Strict).unwrap();
        assert_eq!(links.len(), 2);

        let temp = &links[0];
        assert_eq!(temp.uri, "/sensors/temp");
        assert_eq!(
            temp.attribute("rt").unwrap().value.as_deref(),
            Some("temperature")
        );
        assert_eq!(temp.attribute("if").unwrap().value.as_deref(), Some("sensor"));
        assert!(temp.has_flag("obs"));

        assert_eq!(links[1].uri, "/sensors/hum");
        assert_eq!(
            links[1].attribute("rt").unwrap().value.as_deref(),
            Some("humidity")
        );
    }

    #[test]
    fn test_strict_rejects_repeated_title() {
        let input = "</a>;title=\"one\";title=\"two\"";
        assert!(matches!(
            parse(input, ParseMode::Strict),
            Err(Error::RepeatedAttribute(_))
        ));
        let links = parse(input, ParseMode::Lenient).unwrap();
        assert_eq!(
            links[0].attribute("title").unwrap().value.as_deref(),
            Some("one")
        );
    }

    #[test]
    fn test_serialize_quoting() {
        let links = vec![WebLink::new("/x")
            .with_attribute("sz", Some("128"))
            .with_attribute("rt", Some("core.s"))
            .with_attribute("obs", None)];
        assert_eq!(serialize(&links), "</x>;sz=128;rt=\"core.s\";obs");
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let links = vec![
            WebLink::new("/sensors/temp")
                .with_attribute("rt", Some("temperature"))
                .with_attribute("obs", None),
            WebLink::new("/config").with_attribute("title", Some("device config")),
        ];
        let wire = serialize(&links);
        let parsed = parse(&wire, ParseMode::Strict).unwrap();
        assert_eq!(parsed, links);
    }

    #[test]
    fn test_multi_value_split() {
        let links = parse("</a>;rt=\"one two three\"", ParseMode::Strict).unwrap();
        let rt = links[0].attribute("rt").unwrap();
        assert_eq!(split_multi_value(rt), vec!["one", "two", "three"]);
    }
}
