//! Error types for response templating.

use thiserror::Error;

/// Failure while compiling or rendering one templated field.
///
/// Any of these aborts the whole transform; the transformer turns it into
/// a single failure response.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template source is not valid template syntax.
    #[error("{id}: {reason}")]
    Compile { id: String, reason: String },

    /// Evaluation failed (missing helper, bad argument, denied system key, ...).
    #[error("{id}: {reason}")]
    Render { id: String, reason: String },

    /// A body file could not be read.
    #[error(transparent)]
    FileAccess(#[from] FileError),

    /// A JSON body rendered to text that is no longer valid JSON.
    #[error("Rendered JSON body is not valid JSON: {reason}")]
    InvalidJsonBody { reason: String },
}

impl TemplateError {
    pub(crate) fn render(id: &str, reason: impl ToString) -> Self {
        TemplateError::Render {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failure raised by a user-supplied helper function.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HelperError(pub String);

impl HelperError {
    pub fn new(message: impl Into<String>) -> Self {
        HelperError(message.into())
    }
}

/// Context model assembly failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// An extra model entry tried to claim a reserved name.
    #[error("Model entry '{0}' collides with a reserved name")]
    ReservedName(String),
}

/// Body file access failure.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("Body file not found: {0}")]
    NotFound(String),

    #[error("Access denied to body file outside the files root: {0}")]
    OutsideRoot(String),

    #[error("Failed to read body file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid transformer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid permitted system key pattern '{pattern}': {reason}")]
    InvalidSystemKeyPattern { pattern: String, reason: String },
}
