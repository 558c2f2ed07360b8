//! Template engine for dynamic responses.
//!
//! Uses Handlebars for template rendering with the request and the data
//! extracted by the matched stub.

use crate::request::Request;
use crate::stub::ExtractedData;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Serialize)]
pub struct TemplateContext<'a> {
    /// Named captures from every extract, merged in extractor-key order
    pub captures: HashMap<String, String>,
    /// Positional captures from every extract, concatenated in extractor-key order
    pub fixed: Vec<String>,
    /// Raw extracts keyed by extractor id
    pub extracts: &'a ExtractedData,
    /// Query parameters (first value per key)
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: &'a HashMap<String, String>,
    /// Request method
    pub method: &'a str,
    /// Request path
    pub request_path: &'a str,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a str>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(request: &'a Request, extracts: &'a ExtractedData) -> Self {
        let mut keys: Vec<&String> = extracts.keys().collect();
        keys.sort();

        let mut captures = HashMap::new();
        let mut fixed = Vec::new();
        for key in keys {
            let extract = &extracts[key];
            captures.extend(extract.named.iter().map(|(k, v)| (k.clone(), v.clone())));
            fixed.extend(extract.fixed.iter().cloned());
        }

        let mut query = HashMap::new();
        for (key, value) in &request.query {
            query.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let body = request.body_str().filter(|b| !b.is_empty());
        let json = body.and_then(|b| serde_json::from_str(b).ok());

        Self {
            captures,
            fixed,
            extracts,
            query,
            headers: &request.headers,
            method: &request.method,
            request_path: &request.path,
            body,
            json,
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Bodies are JSON or plain text.
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string against a request and its extracted data.
    pub fn render(
        &self,
        template: &str,
        request: &Request,
        extracts: &ExtractedData,
    ) -> Result<String, handlebars::RenderError> {
        let ctx = TemplateContext::new(request, extracts);
        self.handlebars.render_template(template, &ctx)
    }

    /// Render a JSON value with templates in string fields.
    pub fn render_json(
        &self,
        json: &serde_json::Value,
        request: &Request,
        extracts: &ExtractedData,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        let ctx = TemplateContext::new(request, extracts);
        self.render_json_value(json, &ctx)
    }

    fn render_json_value(
        &self,
        value: &serde_json::Value,
        ctx: &TemplateContext<'_>,
    ) -> Result<serde_json::Value, handlebars::RenderError> {
        use serde_json::Value;

        Ok(match value {
            Value::String(s) if s.contains("{{") => {
                Value::String(self.handlebars.render_template(s, ctx)?)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_json_value(item, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.render_json_value(v, ctx)?)))
                    .collect::<Result<_, handlebars::RenderError>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

handlebars::handlebars_helper!(upper_helper: |value: str| value.to_uppercase());
handlebars::handlebars_helper!(lower_helper: |value: str| value.to_lowercase());

/// `{{json text}}` pretty-prints `text` when it parses as JSON.
fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let raw = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    let pretty = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|json| serde_json::to_string_pretty(&json).ok());
    out.write(pretty.as_deref().unwrap_or(raw))?;
    Ok(())
}

/// Random version 4 UUID.
fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let uuid = format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    );
    out.write(&uuid)?;
    Ok(())
}

/// `{{now}}` or `{{now "%Y-%m-%d"}}`, in UTC.
fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");
    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

/// `{{random min max}}`, inclusive, defaulting to 0..=100.
fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let bound = |i: usize, fallback: i64| h.param(i).and_then(|v| v.value().as_i64()).unwrap_or(fallback);
    let (min, max) = (bound(0, 0), bound(1, 100));
    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: fallback when value is missing, null or "".
fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let fallback = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");
    let rendered = match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) | None => {
            fallback.to_string()
        }
        Some(other) => other.to_string(),
    };
    out.write(&rendered)?;
    Ok(())
}
