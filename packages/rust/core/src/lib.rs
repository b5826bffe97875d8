//! Pipeline orchestration for webrag.
//!
//! This crate wires the fetcher, converter, store and generator into named
//! stages of a DAG [`Pipeline`](pipeline::Pipeline), provides the prompt
//! templating stage, and builds the two question-answering pipelines.

pub mod component;
pub mod demo;
pub mod pipeline;
pub mod prompt;
pub mod stages;

pub use component::{Component, Inputs, Outputs, Port, Value, ValueKind};
pub use pipeline::{Pipeline, PipelineInputs, PipelineOutput, RunObserver, SilentObserver};
pub use prompt::{PromptBuilder, PromptContext};
pub use stages::Bm25Retriever;
