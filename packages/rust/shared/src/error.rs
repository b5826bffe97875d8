//! Error types for webrag.
//!
//! Library crates use [`RagError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all webrag operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Missing or invalid configuration (including an unset credential).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Network or HTTP failure for a single URL.
    #[error("fetch error for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Content could not be converted into a document.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Template parsing failed or a referenced binding was missing.
    #[error("template error: {message}")]
    Template { message: String },

    /// The LLM endpoint call failed.
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Document store write or lookup failure.
    #[error("store error: {0}")]
    Store(String),

    /// Static pipeline validation failure, raised before any stage runs.
    #[error("pipeline error: {message}")]
    Pipeline { message: String },

    /// A stage failed while the pipeline was running.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<RagError>,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    /// Create a configuration error from any displayable message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a fetch error for `url`.
    pub fn fetch(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a template error from any displayable message.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create a pipeline validation error from any displayable message.
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline {
            message: msg.into(),
        }
    }

    /// Wrap an error with the name of the stage it came from.
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Name of the stage that produced this error, if it was raised during a run.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The innermost error, with any stage wrappers removed.
    pub fn root(&self) -> &RagError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Distinct failure kinds of a chat-completions call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("endpoint rejected the credential (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("rate limited")]
    RateLimited,

    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response body: {0}")]
    MalformedResponse(String),

    #[error("response contained no choices")]
    EmptyResponse,
}

impl GenerationError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::RateLimited => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Unauthorized { .. } | Self::MalformedResponse(_) | Self::EmptyResponse => false,
        }
    }
}
