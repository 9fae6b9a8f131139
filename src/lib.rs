//! Zentinel Response Template
//!
//! Response templating transformer for the Zentinel mock server. Stub
//! responses may carry Handlebars templates in their body, body file name,
//! headers and proxy target; the transformer renders them against each
//! incoming request.
//!
//! # Features
//!
//! - **Request Model**: Path, path params, query, headers, cookies and body exposed as `request.*`
//! - **Compiled Template Cache**: Bounded LRU cache with one compile per key under concurrency
//! - **Body Files**: Templated file names, with optional templating of the file contents
//! - **Proxy Targets**: Templated proxy base URL and extra proxy request headers
//! - **Helpers**: Built-in helpers plus user-supplied helper functions
//! - **Error Containment**: Template failures become a plain-text 500 and a diagnostic
//!
//! # Example Configuration
//!
//! ```yaml
//! templating:
//!   global: true
//!   max_cache_entries: 1000
//!
//! stubs:
//!   - id: user-by-id
//!     request:
//!       url_path_template: /users/{id}
//!     response:
//!       status: 200
//!       headers:
//!         X-Request-Path: "{{request.path}}"
//!       body:
//!         type: json
//!         content:
//!           id: "{{request.path_params.id}}"
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod files;
pub mod model;
pub mod request;
pub mod template;
pub mod transformer;

#[cfg(test)]
mod test_support;

pub use config::{
    ResponseBody, ResponseDefinition, StubMapping, TemplatingConfig, TransformerConfig,
};
pub use error::{ConfigError, FileError, HelperError, ModelError, TemplateError};
pub use event::{ServeEvent, SubEvent};
pub use files::{DirectorySource, FileSource};
pub use request::Request;
pub use transformer::ResponseTemplateTransformer;
