//! Incoming request representation.
//!
//! Also holds the path template parser used to expose named path segments
//! (e.g. `/users/{id}`) to templates, and the query/cookie parsing that
//! feeds the request model.

use crate::config::HttpHeaders;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An incoming HTTP request as seen by the transformer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Path plus query string (e.g. `/users/1?page=2`)
    pub url: String,

    /// Absolute URL including scheme and host, when known
    #[serde(default)]
    pub absolute_url: Option<String>,

    /// Request headers
    #[serde(default)]
    pub headers: HttpHeaders,

    /// Request body as text
    #[serde(default)]
    pub body: Option<String>,

    /// Client address
    #[serde(default)]
    pub client_ip: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    /// Create a request for the given method and URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Add a header value, appending to any existing values for the key.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let mut values = self
            .headers
            .get(&key)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        values.push(value.into());
        self.headers.insert(key, values);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Path portion of the URL.
    pub fn path(&self) -> &str {
        match self.url.split_once('?') {
            Some((path, _)) => path,
            None => &self.url,
        }
    }

    /// Raw query string, if any.
    pub fn query_string(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, query)| query)
    }

    /// Scheme, host and port from the absolute URL.
    pub fn base_url(&self) -> Option<&str> {
        let absolute = self.absolute_url.as_deref()?;
        let scheme_end = absolute.find("://")? + 3;
        let host_end = absolute[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or(absolute.len());
        Some(&absolute[..host_end])
    }

    /// Query parameters with all values per key, in order of appearance.
    pub fn query_params(&self) -> IndexMap<String, Vec<String>> {
        parse_query_string(self.query_string().unwrap_or(""))
    }

    /// Cookies from all `Cookie` headers.
    pub fn cookies(&self) -> IndexMap<String, Vec<String>> {
        let mut cookies: IndexMap<String, Vec<String>> = IndexMap::new();
        for header in self.headers.get("cookie").unwrap_or_default() {
            for part in header.split(';') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (name, value) = part.split_once('=').unwrap_or((part, ""));
                cookies
                    .entry(name.trim().to_string())
                    .or_default()
                    .push(value.trim().to_string());
            }
        }
        cookies
    }
}

/// Parse a query string into keys with all of their values.
fn parse_query_string(query: &str) -> IndexMap<String, Vec<String>> {
    let mut params: IndexMap<String, Vec<String>> = IndexMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        params
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }

    params
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    match urlencoding::decode(&s) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => s,
    }
}

/// Path with named parameter segments, e.g. `/users/{id}/posts/{post}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    /// Parse a template. An unclosed `{` is kept as literal text.
    pub fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            current.push_str(&rest[..open]);
            if !current.is_empty() {
                segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
            }
            segments.push(TemplateSegment::Param(rest[open + 1..close].to_string()));
            rest = &rest[close + 1..];
        }
        current.push_str(rest);
        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        Self { segments }
    }

    /// Match a request path, returning the named captures in template order.
    ///
    /// A parameter never spans a `/`; within its path segment it extends up
    /// to the next literal of the template.
    pub fn captures(&self, path: &str) -> Option<IndexMap<String, String>> {
        let mut params = IndexMap::new();
        let mut remaining = path;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => {
                    remaining = remaining.strip_prefix(lit.as_str())?;
                }
                TemplateSegment::Param(name) => {
                    let segment = &remaining[..remaining.find('/').unwrap_or(remaining.len())];
                    // Only the part of the next literal inside this segment bounds the capture.
                    let end = match self.segments.get(i + 1) {
                        Some(TemplateSegment::Literal(next)) => {
                            let head = next.split('/').next().unwrap_or("");
                            if head.is_empty() {
                                segment.len()
                            } else {
                                segment.find(head)?
                            }
                        }
                        _ => segment.len(),
                    };
                    if end == 0 {
                        return None;
                    }
                    params.insert(name.clone(), remaining[..end].to_string());
                    remaining = &remaining[end..];
                }
            }
        }

        remaining.is_empty().then_some(params)
    }
}
