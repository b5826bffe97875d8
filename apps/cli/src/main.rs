//! webrag CLI: question answering over web pages and stored documents.
//!
//! Runs the web QA and RAG pipelines against an OpenAI-compatible
//! chat-completions endpoint.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
