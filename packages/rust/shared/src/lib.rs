//! Shared types, error model, and configuration for webrag.
//!
//! This crate is the foundation depended on by all other webrag crates.
//! It provides:
//! - [`RagError`] and [`GenerationError`], the unified error taxonomy
//! - Domain types ([`Document`], [`ByteStream`], [`GenerationResult`])
//! - Configuration ([`AppConfig`], config loading) and [`Credential`] loading

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ConverterConfig, Credential, FetchConfig, LlmConfig, OutputFormat,
    RetrievalConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    load_credential,
};
pub use error::{GenerationError, RagError, Result};
pub use types::{
    ByteStream, Document, FetchFailure, GenerationResult, Metadata, ReplyMeta, Usage,
    content_hash,
};
