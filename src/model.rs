//! Context model assembly.
//!
//! Builds the environment templates are rendered against: the reserved
//! `parameters` and `request` entries plus any entries contributed by a
//! [`ModelExtension`].

use crate::config::{Parameters, ResponseDefinition};
use crate::error::ModelError;
use crate::files::FileSource;
use crate::request::{PathTemplate, Request};
use base64::Engine;
use handlebars::Context;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

/// Reserved model entry holding the transformer parameters.
pub const PARAMETERS: &str = "parameters";
/// Reserved model entry holding the request facts.
pub const REQUEST: &str = "request";

/// Contributes extra entries to the context model.
pub trait ModelExtension: Send + Sync {
    /// Entries to add next to `parameters` and `request`.
    ///
    /// Returning a reserved name fails the model build.
    fn extra_model_elements(
        &self,
        request: &Request,
        response: &ResponseDefinition,
        files: &dyn FileSource,
        parameters: &Parameters,
    ) -> Map<String, Value>;
}

/// Immutable evaluation environment for one request.
#[derive(Debug, Clone)]
pub struct ContextModel {
    context: Context,
}

impl ContextModel {
    /// Assemble the model. Extra entries never overwrite reserved ones.
    pub fn build(
        request: &Request,
        path_template: Option<&str>,
        parameters: &Parameters,
        extra: Map<String, Value>,
    ) -> Result<Self, ModelError> {
        let mut entries = Map::new();
        entries.insert(
            PARAMETERS.to_string(),
            Value::Object(parameters.as_map().clone()),
        );
        entries.insert(
            REQUEST.to_string(),
            RequestTemplateModel::from_request(request, path_template).into_value(),
        );

        for (name, value) in extra {
            if entries.contains_key(&name) {
                return Err(ModelError::ReservedName(name));
            }
            entries.insert(name, value);
        }

        Ok(Self {
            context: Context::from(Value::Object(entries)),
        })
    }

    /// Look up a top-level entry.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.context.data().get(name)
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }
}

/// Request facts exposed to templates under `request`.
#[derive(Debug, Clone, Default)]
pub struct RequestTemplateModel {
    pub url: String,
    pub path: String,
    pub path_segments: Vec<String>,
    pub path_params: IndexMap<String, String>,
    pub method: String,
    pub query_all: IndexMap<String, Vec<String>>,
    pub headers_all: IndexMap<String, Vec<String>>,
    pub cookies_all: IndexMap<String, Vec<String>>,
    pub base_url: Option<String>,
    pub client_ip: Option<String>,
    pub body: Option<String>,
}

impl RequestTemplateModel {
    /// Gather request facts, matching the path against the stub's template.
    pub fn from_request(request: &Request, path_template: Option<&str>) -> Self {
        let path = request.path().to_string();
        let path_params = path_template
            .and_then(|t| PathTemplate::parse(t).captures(&path))
            .unwrap_or_default();
        let path_segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        // Lower-case names so templates can use `request.headers.user-agent`.
        let mut headers_all: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, values) in request.headers.iter() {
            headers_all
                .entry(name.to_ascii_lowercase())
                .or_default()
                .extend(values.iter().cloned());
        }

        Self {
            url: request.url.clone(),
            path,
            path_segments,
            path_params,
            method: request.method.clone(),
            query_all: request.query_params(),
            headers_all,
            cookies_all: request.cookies(),
            base_url: request.base_url().map(String::from),
            client_ip: request.client_ip.clone(),
            body: request.body.clone(),
        }
    }

    /// JSON form handed to templates.
    pub fn into_value(self) -> Value {
        let json_body = self
            .body
            .as_deref()
            .and_then(|b| serde_json::from_str::<Value>(b).ok());
        let body_base64 = self
            .body
            .as_deref()
            .map(|b| base64::engine::general_purpose::STANDARD.encode(b));

        let mut model = json!({
            "url": self.url,
            "path": self.path,
            "path_segments": self.path_segments,
            "path_params": self.path_params,
            "method": self.method,
            "query": first_values(&self.query_all),
            "query_all": self.query_all,
            "headers": first_values(&self.headers_all),
            "headers_all": self.headers_all,
            "cookies": first_values(&self.cookies_all),
            "cookies_all": self.cookies_all,
        });

        if let Value::Object(map) = &mut model {
            let optional = [
                ("base_url", self.base_url.map(Value::String)),
                ("client_ip", self.client_ip.map(Value::String)),
                ("body", self.body.map(Value::String)),
                ("body_base64", body_base64.map(Value::String)),
                ("json", json_body),
            ];
            for (name, value) in optional {
                if let Some(value) = value {
                    map.insert(name.to_string(), value);
                }
            }
        }

        model
    }
}

fn first_values(all: &IndexMap<String, Vec<String>>) -> IndexMap<&str, &str> {
    all.iter()
        .filter_map(|(k, v)| v.first().map(|first| (k.as_str(), first.as_str())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(request: &Request, template: Option<&str>) -> ContextModel {
        ContextModel::build(request, template, &Parameters::new(), Map::new()).unwrap()
    }

    #[test]
    fn test_reserved_entries_present() {
        let params = Parameters::new().with("greeting", "hi");
        let model = ContextModel::build(
            &Request::new("GET", "/a"),
            None,
            &params,
            Map::new(),
        )
        .unwrap();

        assert_eq!(model.get("parameters").unwrap()["greeting"], "hi");
        assert_eq!(model.get("request").unwrap()["path"], "/a");
    }

    #[test]
    fn test_request_facts() {
        let request = Request::new("post", "/users/42/posts?f=hello&tag=a&tag=b")
            .with_header("User-Agent", "test-client")
            .with_header("Cookie", "session=abc")
            .with_body(r#"{"name":"John"}"#);
        let model = build(&request, Some("/users/{id}/posts"));
        let req = model.get("request").unwrap();

        assert_eq!(req["method"], "post");
        assert_eq!(req["url"], "/users/42/posts?f=hello&tag=a&tag=b");
        assert_eq!(req["path"], "/users/42/posts");
        assert_eq!(req["path_segments"], json!(["users", "42", "posts"]));
        assert_eq!(req["path_params"]["id"], "42");
        assert_eq!(req["query"]["f"], "hello");
        assert_eq!(req["query"]["tag"], "a");
        assert_eq!(req["query_all"]["tag"], json!(["a", "b"]));
        assert_eq!(req["headers"]["user-agent"], "test-client");
        assert_eq!(req["cookies"]["session"], "abc");
        assert_eq!(req["json"]["name"], "John");
        assert_eq!(req["body_base64"], "eyJuYW1lIjoiSm9obiJ9");
    }

    #[test]
    fn test_header_names_differing_in_case_merge() {
        let request = Request::new("GET", "/")
            .with_header("Accept", "text/plain")
            .with_header("accept", "application/json");
        let model = build(&request, None);
        let req = model.get("request").unwrap();

        assert_eq!(req["headers_all"]["accept"], json!(["text/plain", "application/json"]));
        assert_eq!(req["headers"]["accept"], "text/plain");
    }

    #[test]
    fn test_unmatched_template_yields_no_params() {
        let model = build(&Request::new("GET", "/other"), Some("/users/{id}"));
        assert_eq!(model.get("request").unwrap()["path_params"], json!({}));
    }

    #[test]
    fn test_extra_entries_added() {
        let mut extra = Map::new();
        extra.insert("tenant".to_string(), json!("acme"));
        let model = ContextModel::build(
            &Request::new("GET", "/"),
            None,
            &Parameters::new(),
            extra,
        )
        .unwrap();
        assert_eq!(model.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn test_extra_entry_named_request_fails() {
        let mut extra = Map::new();
        extra.insert("request".to_string(), json!("spoofed"));
        let err = ContextModel::build(
            &Request::new("GET", "/"),
            None,
            &Parameters::new(),
            extra,
        )
        .unwrap_err();
        assert_eq!(err, ModelError::ReservedName("request".to_string()));
    }

    #[test]
    fn test_extra_entry_named_parameters_fails() {
        let mut extra = Map::new();
        extra.insert("parameters".to_string(), json!({}));
        let result = ContextModel::build(
            &Request::new("GET", "/"),
            None,
            &Parameters::new(),
            extra,
        );
        assert!(matches!(result, Err(ModelError::ReservedName(name)) if name == "parameters"));
    }
}
