//! Template engine for dynamic responses.
//!
//! Uses Handlebars for compiling and rendering. A [`TemplateEngine`] owns one
//! immutable registry holding every helper; each [`CompiledTemplate`] shares
//! that registry and can be rendered any number of times, from any thread.

use crate::error::{ConfigError, HelperError, TemplateError};
use crate::model::ContextModel;
use globset::{Glob, GlobSet, GlobSetBuilder};
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
    Renderable, StringOutput, Template,
};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A named helper: `(args, options, context) -> value`.
pub type HelperFn =
    dyn Fn(&[Value], &Map<String, Value>, &Value) -> Result<Value, HelperError> + Send + Sync;

/// Helpers by name, fixed once the engine is built.
pub type HelperTable = BTreeMap<String, Arc<HelperFn>>;

/// Compiles template sources.
pub trait TemplateProvider: Send + Sync {
    fn compile(&self, source: &str) -> Result<CompiledTemplate, TemplateError>;
}

/// An immutable compiled template.
///
/// Cloning is cheap; a clone stays usable after its cache entry is evicted.
#[derive(Clone)]
pub struct CompiledTemplate {
    id: String,
    template: Arc<Template>,
    registry: Arc<Handlebars<'static>>,
}

impl CompiledTemplate {
    /// Synthetic identifier (`inline@<hex>`) used in error messages.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Render against a context model.
    pub fn render(&self, model: &ContextModel) -> Result<String, TemplateError> {
        let mut rc = RenderContext::new(None);
        let mut out = StringOutput::new();
        self.template
            .render(self.registry.as_ref(), model.context(), &mut rc, &mut out)
            .map_err(|e| TemplateError::render(&self.id, e))?;
        out.into_string()
            .map_err(|e| TemplateError::render(&self.id, e))
    }
}

impl fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Allow-list of environment keys the `systemValue` helper may read.
#[derive(Debug, Clone, Default)]
pub struct SystemKeyPolicy {
    permitted: Option<GlobSet>,
}

impl SystemKeyPolicy {
    /// Every key may be read.
    pub fn unrestricted() -> Self {
        Self { permitted: None }
    }

    /// Build from glob patterns; `None` means unrestricted.
    pub fn new(patterns: Option<&[String]>) -> Result<Self, ConfigError> {
        let Some(patterns) = patterns else {
            return Ok(Self::unrestricted());
        };

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidSystemKeyPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| ConfigError::InvalidSystemKeyPattern {
                pattern: patterns.join(","),
                reason: e.to_string(),
            })?;
        Ok(Self {
            permitted: Some(set),
        })
    }

    pub fn is_permitted(&self, key: &str) -> bool {
        self.permitted
            .as_ref()
            .map_or(true, |set| set.is_match(key))
    }
}

/// Handlebars-backed template provider.
pub struct TemplateEngine {
    registry: Arc<Handlebars<'static>>,
}

impl TemplateEngine {
    /// Create an engine with the built-in helpers plus `helpers`.
    ///
    /// A user helper with the same name as a built-in replaces it.
    pub fn new(policy: SystemKeyPolicy, helpers: &HelperTable) -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("jsonPath", Box::new(json_path_helper));

        handlebars.register_helper(
            "systemValue",
            Box::new(
                move |h: &Helper,
                      _: &Handlebars,
                      _: &Context,
                      _: &mut RenderContext,
                      out: &mut dyn Output|
                      -> HelperResult {
                    let key = h
                        .hash_get("key")
                        .or_else(|| h.param(0))
                        .and_then(|v| v.value().as_str())
                        .ok_or_else(|| {
                            RenderErrorReason::Other("systemValue requires a key".to_string())
                        })?;
                    let kind = h
                        .hash_get("type")
                        .and_then(|v| v.value().as_str())
                        .unwrap_or("ENVIRONMENT");
                    if !kind.eq_ignore_ascii_case("ENVIRONMENT") {
                        return Err(RenderErrorReason::Other(format!(
                            "Unsupported system value type: {}",
                            kind
                        ))
                        .into());
                    }
                    if !policy.is_permitted(key) {
                        return Err(
                            RenderErrorReason::Other(format!("Access to {} is denied", key)).into(),
                        );
                    }
                    out.write(&std::env::var(key).unwrap_or_default())?;
                    Ok(())
                },
            ),
        );

        for (name, function) in helpers {
            let helper_name = name.clone();
            let function = Arc::clone(function);
            handlebars.register_helper(
                name,
                Box::new(
                    move |h: &Helper,
                          _: &Handlebars,
                          ctx: &Context,
                          _: &mut RenderContext,
                          out: &mut dyn Output|
                          -> HelperResult {
                        let args: Vec<Value> =
                            h.params().iter().map(|p| p.value().clone()).collect();
                        let options: Map<String, Value> = h
                            .hash()
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.value().clone()))
                            .collect();
                        let value = function(&args, &options, ctx.data()).map_err(|e| {
                            RenderErrorReason::Other(format!("Helper '{}' failed: {}", helper_name, e))
                        })?;
                        write_value(out, &value)?;
                        Ok(())
                    },
                ),
            );
        }

        // Don't escape HTML by default (we're not rendering HTML)
        handlebars.register_escape_fn(handlebars::no_escape);

        Self {
            registry: Arc::new(handlebars),
        }
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(SystemKeyPolicy::unrestricted(), &HelperTable::new())
    }
}

impl TemplateProvider for TemplateEngine {
    fn compile(&self, source: &str) -> Result<CompiledTemplate, TemplateError> {
        let id = template_id(source);
        let template = Template::compile(source).map_err(|e| TemplateError::Compile {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(CompiledTemplate {
            id,
            template: Arc::new(template),
            registry: Arc::clone(&self.registry),
        })
    }
}

impl fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

fn template_id(source: &str) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    format!("inline@{:x}", hasher.finish())
}

/// Strings render raw, null renders empty, everything else as JSON text.
fn write_value(out: &mut dyn Output, value: &Value) -> HelperResult {
    match value {
        Value::String(s) => out.write(s)?,
        Value::Null => {}
        other => out.write(&other.to_string())?,
    }
    Ok(())
}

// Built-in helpers

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h.param(0).map(|v| v.value());
    match param {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(json) => out.write(&serde_json::to_string_pretty(&json).unwrap_or_default())?,
            Err(_) => out.write(s)?,
        },
        Some(other) => out.write(&serde_json::to_string_pretty(other).unwrap_or_default())?,
        None => {}
    }
    Ok(())
}

fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use chrono::Utc;
    use std::fmt::Write;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let mut formatted = String::new();
    write!(formatted, "{}", Utc::now().format(format))
        .map_err(|_| RenderErrorReason::Other(format!("Invalid date format: {}", format)))?;
    out.write(&formatted)?;
    Ok(())
}

fn random_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    if min > max {
        return Err(RenderErrorReason::Other(format!(
            "random: min {} is greater than max {}",
            min, max
        ))
        .into());
    }

    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(Value::String(_)) | Some(Value::Null) | None => out.write(default)?,
        Some(other) => out.write(&other.to_string())?,
    }
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}

/// `{{jsonPath request.body '$.name'}}`; the document may be JSON text or a value.
fn json_path_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use jsonpath_rust::JsonPath;

    let document = match h.param(0).map(|v| v.value()) {
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).map_err(|e| {
            RenderErrorReason::Other(format!("jsonPath: document is not JSON: {}", e))
        })?,
        Some(other) => other.clone(),
        None => return Ok(()),
    };
    let expr = h
        .param(1)
        .and_then(|v| v.value().as_str())
        .ok_or_else(|| RenderErrorReason::Other("jsonPath requires a path".to_string()))?;

    let path = match JsonPath::try_from(expr) {
        Ok(p) => p,
        Err(_) => {
            return Err(
                RenderErrorReason::Other(format!("Invalid JSON path: {}", expr)).into(),
            )
        }
    };

    let found = match path.find(&document) {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Array(items) if items.is_empty() => Value::Null,
        other => other,
    };
    write_value(out, &found)
}
