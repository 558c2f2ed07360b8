//! Stubs: matching rules paired with a response-producing function.

use crate::extractor::{Extract, Extractor};
use crate::matcher::Matcher;
use crate::request::Request;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Extracted data for one request, keyed by extractor id.
pub type ExtractedData = HashMap<String, Extract>;

/// Render function supplied by the stub author.
pub type RenderFn = dyn Fn(&Request, &ExtractedData) -> Response + Send + Sync;

/// Response produced by a stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(body.into())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A registered rule: all matchers must pass, then every extractor
/// contributes data and the render function builds the response.
#[derive(Clone)]
pub struct Stub {
    id: String,
    matchers: Vec<Arc<dyn Matcher>>,
    extractors: Vec<Arc<dyn Extractor>>,
    render: Arc<RenderFn>,
}

impl Stub {
    pub fn new<F>(id: impl Into<String>, render: F) -> Self
    where
        F: Fn(&Request, &ExtractedData) -> Response + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            matchers: Vec::new(),
            extractors: Vec::new(),
            render: Arc::new(render),
        }
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matchers.push(Arc::new(matcher));
        self
    }

    pub fn with_extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractors.push(Arc::new(extractor));
        self
    }

    pub fn with_shared_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_shared_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn matchers(&self) -> &[Arc<dyn Matcher>] {
        &self.matchers
    }

    pub fn extractors(&self) -> &[Arc<dyn Extractor>] {
        &self.extractors
    }

    /// True when every matcher passes, evaluated left to right and
    /// stopping at the first failure.
    pub fn matches_request(&self, request: &Request) -> bool {
        self.matchers.iter().all(|m| m.matches(request))
    }

    /// Run each extractor once. Extractors sharing an id run only the
    /// first time; extractors that find nothing contribute no entry.
    pub fn extract_data(&self, request: &Request) -> ExtractedData {
        let mut data = ExtractedData::new();
        for extractor in &self.extractors {
            if data.contains_key(extractor.id()) {
                continue;
            }
            if let Some(extract) = extractor.extract(request) {
                data.insert(extractor.id().to_string(), extract);
            }
        }
        data
    }

    pub fn render(&self, request: &Request, data: &ExtractedData) -> Response {
        (self.render)(request, data)
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("id", &self.id)
            .field(
                "matchers",
                &self.matchers.iter().map(|m| m.id()).collect::<Vec<_>>(),
            )
            .field(
                "extractors",
                &self.extractors.iter().map(|e| e.id()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
