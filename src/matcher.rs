//! Request matching.
//!
//! A matcher reduces a request to "matches / does not match". Path and
//! query matchers wrap an extractor and match whenever it extracts
//! something; the method matcher compares the verb directly.

use crate::extractor::{Extractor, PathExtractor, PatternError, PatternOptions, QueryExtractor};
use crate::request::{Method, Request};

/// Boolean predicate over a request.
pub trait Matcher: Send + Sync {
    fn id(&self) -> &str;

    fn matches(&self, request: &Request) -> bool;
}

/// Matches whenever the wrapped extractor produces an extract.
#[derive(Debug, Clone)]
pub struct ExtractorMatcher<E> {
    extractor: E,
}

impl<E: Extractor> ExtractorMatcher<E> {
    pub fn new(extractor: E) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn into_extractor(self) -> E {
        self.extractor
    }
}

impl<E: Extractor> Matcher for ExtractorMatcher<E> {
    fn id(&self) -> &str {
        self.extractor.id()
    }

    fn matches(&self, request: &Request) -> bool {
        self.extractor.extract(request).is_some()
    }
}

pub type PathMatcher = ExtractorMatcher<PathExtractor>;
pub type QueryMatcher = ExtractorMatcher<QueryExtractor>;

impl PathMatcher {
    pub fn path(pattern: &str) -> Result<Self, PatternError> {
        PathExtractor::new(pattern).map(Self::new)
    }

    pub fn path_with_options(pattern: &str, options: PatternOptions) -> Result<Self, PatternError> {
        PathExtractor::with_options(pattern, options).map(Self::new)
    }
}

impl QueryMatcher {
    pub fn query<I, K, V>(params: I, match_subset: bool) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        QueryExtractor::new(params, match_subset).map(Self::new)
    }
}

/// Matches requests whose verb equals a fixed method.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    method: Method,
    id: String,
}

impl MethodMatcher {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            id: format!("METHOD {}", method),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }
}

impl Matcher for MethodMatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, request: &Request) -> bool {
        request.method == self.method.as_str()
    }
}
