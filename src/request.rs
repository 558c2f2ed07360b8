//! Inbound request model.
//!
//! The HTTP layer converts whatever it receives into a [`Request`] before
//! handing it to the stub engine, so matchers and extractors never see
//! transport types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The nine standard HTTP verbs accepted by method matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::Get,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Connect,
        Method::Options,
        Method::Trace,
        Method::Patch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the nine standard verbs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown HTTP method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// An inbound HTTP request as seen by matchers, extractors and render functions.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Request verb, kept verbatim so non-standard methods still flow through
    pub method: String,
    /// Request path without the query string
    pub path: String,
    /// Decoded query parameters in arrival order; a key may repeat
    pub query: Vec<(String, String)>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Request body
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build a request from a path that may carry a `?query` suffix.
    pub fn from_target(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        Self::new(method, path).with_query_string(query)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_query_string(mut self, query: &str) -> Self {
        self.query.extend(parse_query_string(query));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Body as UTF-8 text, if it is text.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Parse a query string into ordered key-value pairs.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (decode_component(key), decode_component(value)),
            None => (decode_component(part), String::new()),
        })
        .collect()
}

/// Form-style decoding: `+` is a space, then percent escapes. Text whose
/// escapes do not form valid UTF-8 is kept undecoded.
fn decode_component(s: &str) -> String {
    let spaced = s.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_string_keeps_order_and_repeats() {
        let params = parse_query_string("foo=bar&baz=qux&foo=again");
        assert_eq!(
            params,
            vec![
                ("foo".to_string(), "bar".to_string()),
                ("baz".to_string(), "qux".to_string()),
                ("foo".to_string(), "again".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_query_string_decodes() {
        let params = parse_query_string("name=John%20Doe&city=New+York&flag");
        assert_eq!(params[0], ("name".to_string(), "John Doe".to_string()));
        assert_eq!(params[1], ("city".to_string(), "New York".to_string()));
        assert_eq!(params[2], ("flag".to_string(), String::new()));
    }

    #[test]
    fn test_decode_multibyte_and_invalid_escapes() {
        assert_eq!(decode_component("caf%C3%A9"), "café");
        assert_eq!(decode_component("a%2Bb+c"), "a+b c");
        assert_eq!(decode_component("100%zz"), "100%zz");
        assert_eq!(decode_component("50%"), "50%");
    }

    #[test]
    fn test_truncated_utf8_escape_is_kept_verbatim() {
        let request = Request::new("GET", "/").with_query_string("v=%C3&w=ok");
        assert_eq!(request.query[0], ("v".to_string(), "%C3".to_string()));
        assert_eq!(request.query[1], ("w".to_string(), "ok".to_string()));
    }

    #[test]
    fn test_from_target_splits_query() {
        let request = Request::from_target("GET", "/search?q=rust&page=2");
        assert_eq!(request.path, "/search");
        assert_eq!(request.query.len(), 2);
        assert_eq!(request.query[1], ("page".to_string(), "2".to_string()));
    }

    #[test]
    fn test_method_parsing() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>(), Ok(method));
        }
        assert!("get".parse::<Method>().is_err());
        assert!("PURGE".parse::<Method>().is_err());
    }
}
