//! Configuration for the response template transformer.
//!
//! Defines the transformer settings, stub mappings and the declarative
//! response descriptions whose fields may carry templates.

use crate::error::ConfigError;
use crate::template::SystemKeyPolicy;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Top-level configuration file: transformer settings plus stubs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TemplatingConfig {
    /// Transformer settings
    #[serde(default)]
    pub templating: TransformerConfig,

    /// List of stub mappings
    #[serde(default)]
    pub stubs: Vec<StubMapping>,
}

impl TemplatingConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.templating.validate()?;

        let mut seen = HashSet::new();
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.validate()
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
            if !seen.insert(stub.id.as_str()) {
                anyhow::bail!("Stub {}: duplicate id '{}'", i, stub.id);
            }
        }
        Ok(())
    }

    /// Find a stub by id.
    pub fn stub(&self, id: &str) -> Option<&StubMapping> {
        self.stubs.iter().find(|s| s.id == id)
    }
}

/// Settings accepted by the transformer at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformerConfig {
    /// Apply to every stub, rather than only stubs that opt in
    #[serde(default = "default_true")]
    pub global: bool,

    /// Maximum number of compiled templates kept (absent = unbounded, 0 = no caching)
    #[serde(default)]
    pub max_cache_entries: Option<usize>,

    /// Glob patterns of environment keys templates may read (absent = unrestricted)
    #[serde(default)]
    pub permitted_system_keys: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            global: true,
            max_cache_entries: None,
            permitted_system_keys: None,
        }
    }
}

impl TransformerConfig {
    /// Validate the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        SystemKeyPolicy::new(self.permitted_system_keys.as_deref())?;
        Ok(())
    }
}

/// A single stub mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubMapping {
    /// Unique identifier for this stub
    pub id: String,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// Request pattern (only the parts templating needs)
    #[serde(default)]
    pub request: RequestPattern,

    /// Response to return
    pub response: ResponseDefinition,
}

impl StubMapping {
    /// Create a stub with an empty request pattern.
    pub fn new(id: impl Into<String>, response: ResponseDefinition) -> Self {
        Self {
            id: id.into(),
            name: None,
            request: RequestPattern::default(),
            response,
        }
    }

    /// Set the URL path template (e.g. `/users/{id}`).
    pub fn with_path_template(mut self, template: impl Into<String>) -> Self {
        self.request.url_path_template = Some(template.into());
        self
    }

    /// The path template whose captures are exposed to templates.
    pub fn path_template(&self) -> Option<&str> {
        self.request.url_path_template.as_deref()
    }

    /// Validate the stub mapping.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("Stub id cannot be empty");
        }
        self.request.validate()?;
        self.response.validate()?;
        Ok(())
    }
}

/// Request pattern of a stub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestPattern {
    /// Path with named segments (e.g. `/users/{id}`)
    #[serde(default)]
    pub url_path_template: Option<String>,
}

impl RequestPattern {
    /// Validate the request pattern.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(template) = &self.url_path_template {
            if !template.starts_with('/') {
                anyhow::bail!("Path template must start with '/': {}", template);
            }
        }
        Ok(())
    }
}

/// Response definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Optional reason phrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    /// Response headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HttpHeaders>,

    /// Response body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,

    /// Proxy the request to this base URL instead of answering directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_base_url: Option<String>,

    /// Extra headers added to the proxied request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_proxy_request_headers: Option<HttpHeaders>,

    /// Names of transformers this response opts into
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformers: Vec<String>,

    /// Parameters passed to transformers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformer_parameters: Option<Parameters>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self::new(default_status())
    }
}

impl ResponseDefinition {
    /// Create an empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_message: None,
            headers: None,
            body: None,
            proxy_base_url: None,
            additional_proxy_request_headers: None,
            transformers: Vec::new(),
            transformer_parameters: None,
        }
    }

    /// Plain-text 500 response.
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(500)
            .with_header("Content-Type", ["text/plain"])
            .with_body(ResponseBody::Text {
                content: message.into(),
            })
    }

    /// Add a header with one or more values.
    pub fn with_header<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.headers
            .get_or_insert_with(HttpHeaders::new)
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Proxy to the given base URL.
    pub fn with_proxy_base_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_base_url = Some(url.into());
        self
    }

    /// Add a header to the proxied request.
    pub fn with_proxy_request_header<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.additional_proxy_request_headers
            .get_or_insert_with(HttpHeaders::new)
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Set the transformer parameters.
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.transformer_parameters = Some(parameters);
        self
    }

    /// Whether the response is proxied rather than answered directly.
    pub fn is_proxy(&self) -> bool {
        self.proxy_base_url.is_some()
    }

    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        if let Some(ResponseBody::Base64 { content }) = &self.body {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))?;
        }
        if let Some(ResponseBody::File { path }) = &self.body {
            if path.is_empty() {
                anyhow::bail!("Body file name cannot be empty");
            }
        }
        Ok(())
    }
}

/// Response body configuration.
///
/// Inline content and a body file are variants of one enum, so a response
/// can never carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: Value },
    /// Base64 encoded binary, never templated
    Base64 { content: String },
    /// Body read from a file under the files root
    File { path: String },
}

/// Ordered header map where each key keeps an ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "IndexMap<String, HeaderValues>",
    into = "IndexMap<String, HeaderValues>"
)]
pub struct HttpHeaders {
    entries: IndexMap<String, Vec<String>>,
}

/// Header values as written in configuration: one string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    Single(String),
    Multiple(Vec<String>),
}

impl From<IndexMap<String, HeaderValues>> for HttpHeaders {
    fn from(map: IndexMap<String, HeaderValues>) -> Self {
        let entries = map
            .into_iter()
            .map(|(key, values)| {
                let values = match values {
                    HeaderValues::Single(v) => vec![v],
                    HeaderValues::Multiple(vs) => vs,
                };
                (key, values)
            })
            .collect();
        Self { entries }
    }
}

impl From<HttpHeaders> for IndexMap<String, HeaderValues> {
    fn from(headers: HttpHeaders) -> Self {
        headers
            .entries
            .into_iter()
            .map(|(key, mut values)| {
                let values = if values.len() == 1 {
                    HeaderValues::Single(values.remove(0))
                } else {
                    HeaderValues::Multiple(values)
                };
                (key, values)
            })
            .collect()
    }
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set all values for a key (case-insensitive).
    ///
    /// An existing key keeps its original spelling and position.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into();
        let existing = self
            .entries
            .keys()
            .position(|k| k.eq_ignore_ascii_case(&key));
        match existing.and_then(|index| self.entries.get_index_mut(index)) {
            Some((_, current)) => *current = values,
            None => {
                self.entries.insert(key, values);
            }
        }
    }

    /// All values for a key (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }

    /// First value for a key (case-insensitive).
    pub fn first_value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// Iterate keys and their values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<String>)> for HttpHeaders {
    fn from_iter<T: IntoIterator<Item = (K, Vec<String>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Transformer parameters attached to a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(serde_json::Map<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Read a boolean, accepting `true` as well as the string `"true"`.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.0.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => default,
        }
    }

    pub fn as_map(&self) -> &serde_json::Map<String, Value> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_templated_stub() {
        let yaml = r#"
stubs:
  - id: user-by-id
    request:
      url_path_template: /users/{id}
    response:
      status: 200
      headers:
        Content-Type: application/json
        X-Trace: ["{{request.path}}", "static"]
      body:
        type: text
        content: "User {{request.path_params.id}}"
"#;
        let config: TemplatingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stubs.len(), 1);
        let stub = &config.stubs[0];
        assert_eq!(stub.path_template(), Some("/users/{id}"));

        let headers = stub.response.headers.as_ref().unwrap();
        let keys: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Content-Type", "X-Trace"]);
        assert_eq!(
            headers.get("x-trace").unwrap(),
            &["{{request.path}}".to_string(), "static".to_string()]
        );
        assert_eq!(headers.first_value("content-type"), Some("application/json"));
    }

    #[test]
    fn test_parse_proxy_and_parameters() {
        let yaml = r#"
stubs:
  - id: proxied
    response:
      proxy_base_url: "http://{{request.headers.host}}"
      additional_proxy_request_headers:
        X-Forwarded-For: ["a", "b"]
      transformer_parameters:
        disableBodyFileTemplating: true
"#;
        let config: TemplatingConfig = serde_yaml::from_str(yaml).unwrap();
        let response = &config.stubs[0].response;
        assert!(response.is_proxy());
        assert_eq!(
            response
                .additional_proxy_request_headers
                .as_ref()
                .unwrap()
                .get("X-Forwarded-For")
                .unwrap()
                .len(),
            2
        );
        let params = response.transformer_parameters.as_ref().unwrap();
        assert!(params.get_bool("disableBodyFileTemplating", false));
    }

    #[test]
    fn test_parse_templating_settings() {
        let yaml = r#"
templating:
  global: false
  max_cache_entries: 100
  permitted_system_keys: ["APP_*"]
"#;
        let config: TemplatingConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.templating.global);
        assert_eq!(config.templating.max_cache_entries, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_settings() {
        let config = TransformerConfig::default();
        assert!(config.global);
        assert_eq!(config.max_cache_entries, None);
        assert!(config.permitted_system_keys.is_none());
    }

    #[test]
    fn test_invalid_system_key_pattern_rejected() {
        let config = TransformerConfig {
            permitted_system_keys: Some(vec!["APP_[".to_string()]),
            ..TransformerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_stub_ids_rejected() {
        let config = TemplatingConfig {
            templating: TransformerConfig::default(),
            stubs: vec![
                StubMapping::new("same", ResponseDefinition::new(200)),
                StubMapping::new("same", ResponseDefinition::new(201)),
            ],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate id"));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let stub = StubMapping::new("bad", ResponseDefinition::new(42));
        assert!(stub.validate().is_err());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let response = ResponseDefinition::new(200).with_body(ResponseBody::Base64 {
            content: "not base64!".to_string(),
        });
        assert!(response.validate().is_err());
    }

    #[test]
    fn test_single_value_headers_serialize_as_string() {
        let response = ResponseDefinition::new(200).with_header("X-One", ["1"]);
        let yaml = serde_yaml::to_string(&response).unwrap();
        assert!(yaml.contains("X-One: '1'"));
    }

    #[test]
    fn test_server_error_response() {
        let response = ResponseDefinition::server_error("boom");
        assert_eq!(response.status, 500);
        assert_eq!(
            response.headers.as_ref().unwrap().first_value("Content-Type"),
            Some("text/plain")
        );
        assert_eq!(
            response.body,
            Some(ResponseBody::Text {
                content: "boom".to_string()
            })
        );
    }

    #[test]
    fn test_header_insert_ignores_key_case() {
        let mut headers = HttpHeaders::new();
        headers.insert("Content-Type", vec!["text/plain".to_string()]);
        headers.insert("X-Other", vec!["1".to_string()]);
        headers.insert("content-type", vec!["application/json".to_string()]);

        assert_eq!(headers.len(), 2);
        let keys: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Content-Type", "X-Other"]);
        assert_eq!(headers.first_value("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn test_parameters_get_bool() {
        let params = Parameters::new()
            .with("a", true)
            .with("b", "TRUE")
            .with("c", 1);
        assert!(params.get_bool("a", false));
        assert!(params.get_bool("b", false));
        assert!(!params.get_bool("c", false));
        assert!(params.get_bool("missing", true));
    }
}
