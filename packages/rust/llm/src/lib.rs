//! Chat-completions client for OpenAI-compatible endpoints.
//!
//! The generator takes its [`Credential`](webrag_shared::Credential) explicitly;
//! it never reads the environment itself.

mod client;
mod retry;

pub use client::{ChatGenerator, GeneratorOptions};
