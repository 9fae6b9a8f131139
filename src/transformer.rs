//! Response template transformer.
//!
//! Renders the templated fields of a response description (body, headers,
//! proxy target) against the request and returns a new description. A
//! template failure anywhere fails the whole response: the caller gets a
//! plain-text 500 and the serve event gets a diagnostic.

use crate::cache::{CacheKey, TemplateCache};
use crate::config::{
    HttpHeaders, Parameters, ResponseBody, ResponseDefinition, StubMapping, TransformerConfig,
};
use crate::error::{ConfigError, HelperError, ModelError, TemplateError};
use crate::event::{ServeEvent, SubEvent};
use crate::files::FileSource;
use crate::model::{ContextModel, ModelExtension};
use crate::template::{HelperFn, HelperTable, SystemKeyPolicy, TemplateEngine, TemplateProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Name stubs use to opt into this transformer.
pub const NAME: &str = "response-template";

/// Parameter that serves the resolved body file as-is instead of templating its contents.
pub const DISABLE_BODY_FILE_TEMPLATING: &str = "disableBodyFileTemplating";

static TEMPLATE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"inline@[a-z0-9]+:").expect("Invalid template id regex"));

/// Response Template Transformer
///
/// Holds the compiled template cache for the lifetime of the server; every
/// other piece of state is per call.
pub struct ResponseTemplateTransformer {
    global: bool,
    files: Arc<dyn FileSource>,
    cache: TemplateCache,
    extension: Option<Arc<dyn ModelExtension>>,
}

/// Builder for [`ResponseTemplateTransformer`].
pub struct TransformerBuilder {
    config: TransformerConfig,
    files: Arc<dyn FileSource>,
    provider: Option<Arc<dyn TemplateProvider>>,
    helpers: HelperTable,
    extension: Option<Arc<dyn ModelExtension>>,
}

impl TransformerBuilder {
    /// Use these settings.
    pub fn config(mut self, config: TransformerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom template provider instead of the built-in Handlebars engine.
    ///
    /// Helpers and permitted system keys only configure the built-in engine.
    pub fn provider(mut self, provider: Arc<dyn TemplateProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a named helper.
    pub fn helper<F>(mut self, name: impl Into<String>, helper: F) -> Self
    where
        F: Fn(&[Value], &Map<String, Value>, &Value) -> Result<Value, HelperError>
            + Send
            + Sync
            + 'static,
    {
        let helper: Arc<HelperFn> = Arc::new(helper);
        self.helpers.insert(name.into(), helper);
        self
    }

    /// Contribute extra context model entries.
    pub fn model_extension(mut self, extension: Arc<dyn ModelExtension>) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Validate the settings and create the transformer.
    pub fn build(self) -> Result<ResponseTemplateTransformer, ConfigError> {
        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let policy =
                    SystemKeyPolicy::new(self.config.permitted_system_keys.as_deref())?;
                Arc::new(TemplateEngine::new(policy, &self.helpers))
            }
        };

        info!(
            global = self.config.global,
            max_cache_entries = ?self.config.max_cache_entries,
            helpers = self.helpers.len(),
            "Response template transformer initialized"
        );

        Ok(ResponseTemplateTransformer {
            global: self.config.global,
            files: self.files,
            cache: TemplateCache::new(provider, self.config.max_cache_entries),
            extension: self.extension,
        })
    }
}

impl ResponseTemplateTransformer {
    /// Start building a transformer reading body files from `files`.
    pub fn builder(files: Arc<dyn FileSource>) -> TransformerBuilder {
        TransformerBuilder {
            config: TransformerConfig::default(),
            files,
            provider: None,
            helpers: HelperTable::new(),
            extension: None,
        }
    }

    /// Create a transformer with the built-in engine.
    pub fn new(
        config: TransformerConfig,
        files: Arc<dyn FileSource>,
    ) -> Result<Self, ConfigError> {
        Self::builder(files).config(config).build()
    }

    pub fn name(&self) -> &str {
        NAME
    }

    /// Whether every stub is templated, not only those that opt in.
    pub fn applies_globally(&self) -> bool {
        self.global
    }

    /// Whether this response should go through the transformer.
    pub fn applies_to(&self, response: &ResponseDefinition) -> bool {
        self.global || response.transformers.iter().any(|t| t == NAME)
    }

    /// Render the event's response description.
    ///
    /// Template failures become a plain-text 500 response plus a diagnostic on
    /// the event. Only a context model that cannot be built is returned as an
    /// error, since that is a configuration problem rather than a bad template.
    pub fn transform(&self, event: &mut ServeEvent) -> Result<ResponseDefinition, ModelError> {
        let outcome = {
            let response = &event.response;
            let parameters = response
                .transformer_parameters
                .clone()
                .unwrap_or_default();

            let extra = match &self.extension {
                Some(extension) => extension.extra_model_elements(
                    &event.request,
                    response,
                    self.files.as_ref(),
                    &parameters,
                ),
                None => Map::new(),
            };

            let model = ContextModel::build(
                &event.request,
                event.stub.path_template(),
                &parameters,
                extra,
            )
            .map_err(|e| {
                error!(stub_id = %event.stub.id, error = %e, "Failed to build template model");
                e
            })?;

            self.render_response(&event.stub.id, response, &parameters, &model)
        };

        match outcome {
            Ok(rendered) => Ok(rendered),
            Err(err) => {
                let message = clean_up_error_message(&err.to_string());
                warn!(stub_id = %event.stub.id, error = %message, "Response template failed");
                event.append_sub_event(SubEvent::error(message.clone()));
                Ok(ResponseDefinition::server_error(message))
            }
        }
    }

    fn render_response(
        &self,
        stub_id: &str,
        response: &ResponseDefinition,
        parameters: &Parameters,
        model: &ContextModel,
    ) -> Result<ResponseDefinition, TemplateError> {
        let mut rendered = response.clone();

        if let Some(body) = &response.body {
            rendered.body = Some(self.render_body(stub_id, body, parameters, model)?);
        }

        if let Some(headers) = &response.headers {
            rendered.headers = Some(self.render_headers(headers, model, |key, index| {
                CacheKey::header(stub_id, key, index)
            })?);
        }

        if let Some(proxy_base_url) = &response.proxy_base_url {
            rendered.proxy_base_url =
                Some(self.render(&CacheKey::proxy_url(stub_id), proxy_base_url, model)?);

            if let Some(extra) = &response.additional_proxy_request_headers {
                let headers = self.render_headers(extra, model, |key, index| {
                    CacheKey::proxy_request_header(stub_id, key, index)
                })?;
                rendered.additional_proxy_request_headers = Some(first_values_only(&headers));
            }
        }

        Ok(rendered)
    }

    fn render_body(
        &self,
        stub_id: &str,
        body: &ResponseBody,
        parameters: &Parameters,
        model: &ContextModel,
    ) -> Result<ResponseBody, TemplateError> {
        match body {
            ResponseBody::Text { content } => Ok(ResponseBody::Text {
                content: self.render(&CacheKey::inline_body(stub_id), content, model)?,
            }),
            ResponseBody::Json { content } => {
                let rendered =
                    self.render(&CacheKey::inline_body(stub_id), &content.to_string(), model)?;
                let content = serde_json::from_str(&rendered)
                    .map_err(|e| TemplateError::InvalidJsonBody {
                        reason: e.to_string(),
                    })?;
                Ok(ResponseBody::Json { content })
            }
            ResponseBody::Base64 { .. } => Ok(body.clone()),
            ResponseBody::File { path } => {
                // File names often vary per request, so they are never cached.
                let resolved = self.cache.get_uncached(path)?.render(model)?;

                if parameters.get_bool(DISABLE_BODY_FILE_TEMPLATING, false) {
                    return Ok(ResponseBody::File { path: resolved });
                }

                let contents = self.files.read_text_file(&resolved)?;
                Ok(ResponseBody::Text {
                    content: self.render(
                        &CacheKey::file_body(stub_id, &resolved),
                        &contents,
                        model,
                    )?,
                })
            }
        }
    }

    fn render_headers(
        &self,
        headers: &HttpHeaders,
        model: &ContextModel,
        key_for: impl Fn(&str, usize) -> CacheKey,
    ) -> Result<HttpHeaders, TemplateError> {
        headers
            .iter()
            .map(|(key, values)| {
                let rendered = values
                    .iter()
                    .enumerate()
                    .map(|(index, value)| self.render(&key_for(key, index), value, model))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, TemplateError>((key, rendered))
            })
            .collect()
    }

    fn render(
        &self,
        key: &CacheKey,
        source: &str,
        model: &ContextModel,
    ) -> Result<String, TemplateError> {
        self.cache.get(key, source)?.render(model)
    }

    /// Lifecycle hook: a stub was removed.
    pub fn on_stub_removed(&self, stub: &StubMapping) {
        info!(stub_id = %stub.id, "Stub removed, invalidating template cache");
        self.cache.invalidate_all();
    }

    /// Lifecycle hook: all stubs were reset.
    pub fn on_stubs_reset(&self) {
        info!("Stubs reset, invalidating template cache");
        self.cache.invalidate_all();
    }

    pub fn current_cache_size(&self) -> usize {
        self.cache.size()
    }

    /// `None` means unbounded.
    pub fn configured_max_cache_entries(&self) -> Option<usize> {
        self.cache.capacity()
    }
}

/// The proxied request holds one value per header; later values are dropped.
fn first_values_only(headers: &HttpHeaders) -> HttpHeaders {
    headers
        .iter()
        .filter_map(|(key, values)| values.first().map(|first| (key, vec![first.clone()])))
        .collect()
}

/// Strip synthetic template ids and everything after the first line.
fn clean_up_error_message(raw: &str) -> String {
    let stripped = TEMPLATE_ID.replace_all(raw, "");
    let first_line = stripped.lines().next().unwrap_or("");
    first_line.trim().to_string()
}
