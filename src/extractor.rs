//! Request data extraction.
//!
//! Patterns are literal text mixed with `{name}` (named) and `{}`
//! (positional) placeholders. A placeholder captures a non-empty run of
//! characters bounded only by the literal text around it, so a single
//! placeholder may span several `/`-separated path segments. `{{` and `}}`
//! stand for literal braces.

use crate::request::Request;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

/// Values captured by one extractor invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Extract {
    /// Positional captures in left-to-right pattern order
    pub fixed: Vec<String>,
    /// Named captures
    pub named: HashMap<String, String>,
}

impl Extract {
    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty() && self.named.is_empty()
    }

    /// Combine two extracts. A name captured by both must hold the same
    /// value, otherwise the combination fails.
    fn merge(mut self, other: Extract) -> Option<Extract> {
        self.fixed.extend(other.fixed);
        for (name, value) in other.named {
            match self.named.get(&name) {
                Some(existing) if *existing != value => return None,
                Some(_) => {}
                None => {
                    self.named.insert(name, value);
                }
            }
        }
        Some(self)
    }
}

/// Produces structured data from a request.
pub trait Extractor: Send + Sync {
    /// Stable key derived from the extractor's configuration.
    fn id(&self) -> &str;

    /// `None` when the request does not fit the extractor's pattern.
    fn extract(&self, request: &Request) -> Option<Extract>;
}

impl<E: Extractor + ?Sized> Extractor for std::sync::Arc<E> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn extract(&self, request: &Request) -> Option<Extract> {
        (**self).extract(request)
    }
}

/// Malformed placeholder syntax.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("unclosed placeholder starting at byte {position} in pattern '{pattern}'")]
    UnclosedPlaceholder { pattern: String, position: usize },
    #[error("unmatched '}}' at byte {position} in pattern '{pattern}'")]
    UnmatchedBrace { pattern: String, position: usize },
    #[error("failed to compile pattern '{pattern}': {reason}")]
    Compile { pattern: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Positional,
    Named(String),
}

fn tokenize(pattern: &str) -> Result<Vec<Token>, PatternError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                literal.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    if c == '{' {
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(PatternError::UnclosedPlaceholder {
                        pattern: pattern.to_string(),
                        position: pos,
                    });
                }
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                if name.is_empty() {
                    tokens.push(Token::Positional);
                } else {
                    tokens.push(Token::Named(name));
                }
            }
            '}' => {
                return Err(PatternError::UnmatchedBrace {
                    pattern: pattern.to_string(),
                    position: pos,
                })
            }
            c => literal.push(c),
        }
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// Options controlling how a [`PathPattern`] is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternOptions {
    /// Pattern must align with the start of the input
    pub fixed_start: bool,
    /// Pattern must align with the end of the input
    pub fixed_end: bool,
    pub case_sensitive: bool,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            fixed_start: true,
            fixed_end: true,
            case_sensitive: true,
        }
    }
}

/// A compiled placeholder pattern.
///
/// Placeholders compile to lazy `(.+?)` groups, so with both ends anchored
/// each placeholder takes the shortest span that still lets the rest of the
/// pattern match, and the last one takes whatever remains.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
    /// One entry per capture group, in group order; `None` for positional.
    /// A name used twice gets a group per occurrence.
    groups: Vec<Option<String>>,
    case_sensitive: bool,
}

impl PathPattern {
    pub fn compile(pattern: &str, options: PatternOptions) -> Result<Self, PatternError> {
        let tokens = tokenize(pattern)?;

        let mut expr = String::from("(?s)");
        if !options.case_sensitive {
            expr.push_str("(?i)");
        }
        if options.fixed_start {
            expr.push('^');
        }

        let mut groups: Vec<Option<String>> = Vec::new();
        for token in tokens {
            match token {
                Token::Literal(text) => expr.push_str(&regex::escape(&text)),
                Token::Positional => {
                    expr.push_str("(.+?)");
                    groups.push(None);
                }
                Token::Named(name) => {
                    expr.push_str("(.+?)");
                    groups.push(Some(name));
                }
            }
        }

        if options.fixed_end {
            expr.push('$');
        }

        let regex = Regex::new(&expr).map_err(|e| PatternError::Compile {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
            groups,
            case_sensitive: options.case_sensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn captures(&self, input: &str) -> Option<Extract> {
        let caps = self.regex.captures(input)?;
        let mut extract = Extract::default();
        for (i, group) in self.groups.iter().enumerate() {
            let value = caps.get(i + 1)?.as_str().to_string();
            match group {
                Some(name) => match extract.named.get(name) {
                    Some(first) if !self.same_text(first, &value) => return None,
                    Some(_) => {}
                    None => {
                        extract.named.insert(name.clone(), value);
                    }
                },
                None => extract.fixed.push(value),
            }
        }
        Some(extract)
    }

    fn same_text(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a.to_lowercase() == b.to_lowercase()
        }
    }
}

fn with_trailing_slash(s: &str) -> String {
    if s.is_empty() || s.ends_with('/') {
        s.to_string()
    } else {
        format!("{}/", s)
    }
}

/// Extracts placeholder captures from the request path.
///
/// Pattern and path are compared with a trailing `/` on both, so `/a/b`
/// and `/a/b/` are equivalent. An empty pattern matches only an empty path.
#[derive(Debug, Clone)]
pub struct PathExtractor {
    id: String,
    pattern: PathPattern,
    options: PatternOptions,
}

impl PathExtractor {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Self::with_options(pattern, PatternOptions::default())
    }

    pub fn with_options(pattern: &str, options: PatternOptions) -> Result<Self, PatternError> {
        let compiled = PathPattern::compile(&with_trailing_slash(pattern), options)?;
        let id = if options == PatternOptions::default() {
            format!("PATH '{}'", pattern)
        } else {
            format!(
                "PATH '{}' fixed_start={} fixed_end={} case_sensitive={}",
                pattern, options.fixed_start, options.fixed_end, options.case_sensitive
            )
        };
        Ok(Self {
            id,
            pattern: PathPattern {
                source: pattern.to_string(),
                ..compiled
            },
            options,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn options(&self) -> PatternOptions {
        self.options
    }
}

impl Extractor for PathExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn extract(&self, request: &Request) -> Option<Extract> {
        if self.pattern.as_str().is_empty() {
            return request.path.is_empty().then(Extract::default);
        }
        self.pattern.captures(&with_trailing_slash(&request.path))
    }
}

/// Matches query parameters against (key pattern, value pattern) pairs.
///
/// Each configured pair claims the first still-unclaimed request parameter
/// whose key and value both match, in request order. With `match_subset`
/// the request may carry extra parameters; without it the parameter counts
/// must be equal.
#[derive(Debug, Clone)]
pub struct QueryExtractor {
    id: String,
    params: Vec<(PathPattern, PathPattern)>,
    match_subset: bool,
}

impl QueryExtractor {
    pub fn new<I, K, V>(params: I, match_subset: bool) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::with_case_sensitivity(params, match_subset, true)
    }

    pub fn with_case_sensitivity<I, K, V>(
        params: I,
        match_subset: bool,
        case_sensitive: bool,
    ) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let options = PatternOptions {
            case_sensitive,
            ..PatternOptions::default()
        };

        let compiled = params
            .into_iter()
            .map(|(key, value)| {
                Ok((
                    PathPattern::compile(key.as_ref(), options)?,
                    PathPattern::compile(value.as_ref(), options)?,
                ))
            })
            .collect::<Result<Vec<_>, PatternError>>()?;

        let pairs = compiled
            .iter()
            .map(|(k, v)| format!("{}={}", k.as_str(), v.as_str()))
            .collect::<Vec<_>>()
            .join("&");
        let mut id = format!("QUERY '{}' match_subset={}", pairs, match_subset);
        if !case_sensitive {
            id.push_str(" case_sensitive=false");
        }

        Ok(Self {
            id,
            params: compiled,
            match_subset,
        })
    }

    pub fn match_subset(&self) -> bool {
        self.match_subset
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Extractor for QueryExtractor {
    fn id(&self) -> &str {
        &self.id
    }

    fn extract(&self, request: &Request) -> Option<Extract> {
        let actual = &request.query;
        let cardinality_ok = if self.match_subset {
            actual.len() >= self.params.len()
        } else {
            actual.len() == self.params.len()
        };
        if !cardinality_ok {
            return None;
        }

        let mut claimed = vec![false; actual.len()];
        let mut result = Extract::default();

        // A parameter only fits if its named captures agree with those
        // already claimed by earlier pairs.
        for (key_pattern, value_pattern) in &self.params {
            let (slot, merged) = actual.iter().enumerate().find_map(|(i, (key, value))| {
                if claimed[i] {
                    return None;
                }
                let merged = result
                    .clone()
                    .merge(key_pattern.captures(key)?)?
                    .merge(value_pattern.captures(value)?)?;
                Some((i, merged))
            })?;
            claimed[slot] = true;
            result = merged;
        }

        Some(result)
    }
}
