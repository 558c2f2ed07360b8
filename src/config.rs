//! Configuration for the mock server.
//!
//! Defines stubs (request matchers, extractors, responses) and server
//! settings, loaded from YAML.

use crate::extractor::{Extractor, PathExtractor, PatternOptions, QueryExtractor};
use crate::matcher::{ExtractorMatcher, MethodMatcher};
use crate::request::{Method, Request};
use crate::stub::{ExtractedData, Response, Stub};
use crate::template::TemplateEngine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Stub definitions, in matching order
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Response when no stub matches
    #[serde(default)]
    pub default_response: Option<ResponseDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
            if !seen.insert(stub.id.as_str()) {
                anyhow::bail!("Stub {}: duplicate stub id '{}'", i, stub.id);
            }
        }
        if let Some(response) = &self.default_response {
            response
                .validate()
                .map_err(|e| anyhow::anyhow!("Default response: {}", e))?;
        }
        Ok(())
    }
}

/// A single stub definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Unique identifier for this stub
    pub id: String,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Request matcher
    #[serde(default)]
    pub request: RequestMatcher,

    /// Extra extractors whose data feeds the response template
    #[serde(default)]
    pub extract: Vec<ExtractorDefinition>,

    /// Response to return
    #[serde(default)]
    pub response: ResponseDefinition,
}

impl StubDefinition {
    /// Validate the stub definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Stub id cannot be empty");
        }
        self.request.validate()?;
        for extractor in &self.extract {
            extractor.build()?;
        }
        self.response.validate()?;
        Ok(())
    }

    /// Build a registrable stub. Path and query matchers double as
    /// extractors so their captures reach the template.
    pub fn to_stub(&self, templates: Arc<TemplateEngine>, settings: &GlobalSettings) -> anyhow::Result<Stub> {
        let response = self.response.compile()?;
        let default_content_type = settings.default_content_type.clone();
        let stub_id = self.id.clone();
        let mut stub = Stub::new(self.id.clone(), move |request, data| {
            response.render(&stub_id, &templates, &default_content_type, request, data)
        });

        if let Some(method) = self.request.method {
            stub = stub.with_matcher(MethodMatcher::new(method));
        }
        if let Some(path) = &self.request.path {
            let extractor: Arc<dyn Extractor> = Arc::new(path.build()?);
            stub = stub
                .with_shared_matcher(Arc::new(ExtractorMatcher::new(Arc::clone(&extractor))))
                .with_shared_extractor(extractor);
        }
        if let Some(query) = &self.request.query {
            let extractor: Arc<dyn Extractor> = Arc::new(query.build()?);
            stub = stub
                .with_shared_matcher(Arc::new(ExtractorMatcher::new(Arc::clone(&extractor))))
                .with_shared_extractor(extractor);
        }
        for definition in &self.extract {
            stub = stub.with_shared_extractor(definition.build()?);
        }
        Ok(stub)
    }
}

/// Request matching configuration. Every configured part must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method to match (absent = any)
    #[serde(default)]
    pub method: Option<Method>,

    /// Path pattern
    #[serde(default)]
    pub path: Option<PathDefinition>,

    /// Query parameter patterns
    #[serde(default)]
    pub query: Option<QueryDefinition>,
}

impl RequestMatcher {
    /// Validate the request matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            path.build()?;
        }
        if let Some(query) = &self.query {
            query.build()?;
        }
        Ok(())
    }
}

/// Path placeholder pattern, e.g. `/users/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathDefinition {
    pub pattern: String,
    #[serde(default = "default_true")]
    pub fixed_start: bool,
    #[serde(default = "default_true")]
    pub fixed_end: bool,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

impl PathDefinition {
    pub fn build(&self) -> anyhow::Result<PathExtractor> {
        let options = PatternOptions {
            fixed_start: self.fixed_start,
            fixed_end: self.fixed_end,
            case_sensitive: self.case_sensitive,
        };
        Ok(PathExtractor::with_options(&self.pattern, options)?)
    }
}

/// Query parameter patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDefinition {
    /// Accept requests carrying parameters beyond the configured ones
    #[serde(default = "default_true")]
    pub match_subset: bool,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub params: Vec<QueryParamDefinition>,
}

/// One (key pattern, value pattern) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryParamDefinition {
    pub key: String,
    #[serde(default = "default_value_pattern")]
    pub value: String,
}

fn default_value_pattern() -> String {
    "{}".to_string()
}

impl QueryDefinition {
    pub fn build(&self) -> anyhow::Result<QueryExtractor> {
        let params = self.params.iter().map(|p| (&p.key, &p.value));
        Ok(QueryExtractor::with_case_sensitivity(
            params,
            self.match_subset,
            self.case_sensitive,
        )?)
    }
}

/// Extractor that contributes data without gating the match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractorDefinition {
    Path(PathDefinition),
    Query(QueryDefinition),
}

impl ExtractorDefinition {
    pub fn build(&self) -> anyhow::Result<Arc<dyn Extractor>> {
        Ok(match self {
            ExtractorDefinition::Path(path) => Arc::new(path.build()?),
            ExtractorDefinition::Query(query) => Arc::new(query.build()?),
        })
    }
}

fn default_true() -> bool {
    true
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Whether the body is a handlebars template
    #[serde(default)]
    pub template: bool,
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: None,
            template: false,
        }
    }
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }

    /// Response without request context; templates are not expanded.
    pub fn to_static_response(&self, default_content_type: &str) -> anyhow::Result<Response> {
        let body = match &self.body {
            Some(body) => body.to_bytes()?,
            None => Vec::new(),
        };
        Ok(self.assemble(body, default_content_type))
    }

    /// Resolve every body that does not depend on the request, reading
    /// `file` bodies now so serving never touches the filesystem.
    pub fn compile(&self) -> anyhow::Result<CompiledResponse> {
        let templated = self.template
            && matches!(
                self.body,
                Some(ResponseBody::Text { .. }) | Some(ResponseBody::Json { .. })
            );
        let fixed_body = match &self.body {
            _ if templated => None,
            Some(body) => Some(body.to_bytes()?),
            None => Some(Vec::new()),
        };
        Ok(CompiledResponse {
            definition: self.clone(),
            fixed_body,
        })
    }

    fn assemble(&self, body: Vec<u8>, default_content_type: &str) -> Response {
        let content_type = self
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| {
                self.body
                    .as_ref()
                    .map(|b| b.content_type().to_string())
                    .unwrap_or_else(|| default_content_type.to_string())
            });

        let mut response = Response::new(self.status).with_header("Content-Type", content_type);
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("content-type") {
                response = response.with_header(name.clone(), value.clone());
            }
        }
        response.with_body(body)
    }
}

/// A response definition with its request-independent body resolved.
#[derive(Debug, Clone)]
pub struct CompiledResponse {
    definition: ResponseDefinition,
    /// `None` when the body is a template rendered per request
    fixed_body: Option<Vec<u8>>,
}

impl CompiledResponse {
    /// Build the response for one request.
    pub fn render(
        &self,
        stub_id: &str,
        templates: &TemplateEngine,
        default_content_type: &str,
        request: &Request,
        data: &ExtractedData,
    ) -> Response {
        let body = match (&self.fixed_body, &self.definition.body) {
            (Some(body), _) => Ok(body.clone()),
            (None, Some(ResponseBody::Json { content })) => templates
                .render_json(content, request, data)
                .map_err(anyhow::Error::from)
                .and_then(|v| Ok(serde_json::to_vec(&v)?)),
            (None, Some(ResponseBody::Text { content })) => templates
                .render(content, request, data)
                .map(String::into_bytes)
                .map_err(anyhow::Error::from),
            (None, _) => Ok(Vec::new()),
        };

        match body {
            Ok(body) => self.definition.assemble(body, default_content_type),
            Err(e) => {
                warn!(stub_id = %stub_id, error = %e, "Failed to build response body");
                Response::text(500, format!("Failed to build response for stub {}: {}", stub_id, e))
            }
        }
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_vec(content)?),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } | ResponseBody::File { .. } => "application/octet-stream",
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Pending-connection queue length for the listening socket
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Maximum number of requests processed concurrently
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Processing deadline per request in milliseconds (0 = none)
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,

    /// Log all matched stubs
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Default content type for responses
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl GlobalSettings {
    pub fn process_timeout(&self) -> Option<Duration> {
        (self.process_timeout_ms > 0).then(|| Duration::from_millis(self.process_timeout_ms))
    }
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_in_flight: default_max_in_flight(),
            process_timeout_ms: default_process_timeout_ms(),
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_backlog() -> u32 {
    50
}

fn default_max_in_flight() -> usize {
    256
}

fn default_process_timeout_ms() -> u64 {
    5000
}

fn default_content_type() -> String {
    "application/json".to_string()
}
