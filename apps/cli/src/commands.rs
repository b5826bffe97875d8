//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::info;
use url::Url;

use webrag_core::demo::{self, CONVERTER, FETCHER, LLM};
use webrag_core::{Pipeline, PipelineInputs, PipelineOutput, RunObserver, Value};
use webrag_shared::{
    AppConfig, Document, OutputFormat, RagError, init_config, load_config, load_config_from,
    load_credential,
};
use webrag_store::Bm25Params;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// webrag: answer questions from web pages or a document store with an LLM.
#[derive(Parser)]
#[command(
    name = "webrag",
    version,
    about = "Answer questions about web pages or stored documents with an OpenAI-compatible LLM.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.webrag/webrag.toml.
    #[arg(long, global = true, env = "WEBRAG_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Converter output format.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum FormatArg {
    Markdown,
    Text,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Markdown => OutputFormat::Markdown,
            FormatArg::Text => OutputFormat::Text,
        }
    }
}

/// Overrides for the `[llm]` config section.
#[derive(Args, Debug, Default)]
pub(crate) struct LlmArgs {
    /// Model identifier.
    #[arg(long, env = "WEBRAG_MODEL")]
    pub model: Option<String>,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long, env = "WEBRAG_BASE_URL")]
    pub base_url: Option<String>,

    /// Maximum tokens to generate.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Retries on timeouts, rate limits and 5xx responses.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch web pages and answer a question about their content.
    WebQa {
        /// Page to fetch (repeatable).
        #[arg(long = "url", required = true)]
        urls: Vec<Url>,

        /// Question to answer.
        #[arg(short, long)]
        question: String,

        /// Format the pages are converted to before prompting.
        #[arg(long)]
        format: Option<FormatArg>,

        /// Print the run result as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Answer a question from the built-in sample documents.
    Rag {
        /// Question to answer.
        #[arg(short, long)]
        question: String,

        /// Documents to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the run result as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Fetch and convert web pages, printing the resulting documents.
    Fetch {
        /// Page to fetch (repeatable).
        #[arg(long = "url", required = true)]
        urls: Vec<Url>,

        /// Output format of the converted documents.
        #[arg(long)]
        format: Option<FormatArg>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr; answers go to stdout.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "webrag=info",
        1 => "webrag=debug",
        _ => "webrag=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::WebQa {
            urls,
            question,
            format,
            json,
            llm,
        } => cmd_web_qa(config, urls, &question, format, json, llm).await,
        Command::Rag {
            question,
            top_k,
            json,
            llm,
        } => cmd_rag(config, &question, top_k, json, llm).await,
        Command::Fetch { urls, format } => cmd_fetch(config, urls, format).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

fn apply_llm_args(config: &mut AppConfig, args: &LlmArgs) {
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.llm.base_url = base_url.clone();
    }
    if let Some(max_tokens) = args.max_tokens {
        config.llm.max_tokens = max_tokens;
    }
    if let Some(max_retries) = args.max_retries {
        config.llm.max_retries = max_retries;
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_web_qa(
    mut config: AppConfig,
    urls: Vec<Url>,
    question: &str,
    format: Option<FormatArg>,
    json: bool,
    llm: LlmArgs,
) -> Result<()> {
    apply_llm_args(&mut config, &llm);
    if let Some(format) = format {
        config.converter.format = format.into();
    }

    // Credential first, so a missing key fails before any request is sent.
    let credential = load_credential(&config.llm)?;

    info!(urls = urls.len(), model = %config.llm.model, "answering from web pages");

    let pipeline = demo::build_web_qa_pipeline(&config, credential)?;
    let output = run_with_progress(&pipeline, demo::web_qa_inputs(urls, question)).await?;

    if let Some(failures) = output.get(FETCHER, "failures").and_then(Value::as_failures) {
        for failure in failures {
            eprintln!("  skipped {}: {}", failure.url, failure.message);
        }
    }

    print_answer(&output, json)
}

async fn cmd_rag(
    mut config: AppConfig,
    question: &str,
    top_k: Option<usize>,
    json: bool,
    llm: LlmArgs,
) -> Result<()> {
    apply_llm_args(&mut config, &llm);
    let credential = load_credential(&config.llm)?;

    let store = demo::sample_store(Bm25Params::from(&config.retrieval))?;
    info!(
        documents = demo::sample_documents().len(),
        top_k = top_k.unwrap_or(config.retrieval.top_k),
        "answering from sample documents"
    );

    let pipeline = demo::build_rag_pipeline(&config, Arc::new(store), credential)?;
    let output = run_with_progress(&pipeline, demo::rag_inputs(question, top_k)).await?;

    print_answer(&output, json)
}

async fn cmd_fetch(mut config: AppConfig, urls: Vec<Url>, format: Option<FormatArg>) -> Result<()> {
    if let Some(format) = format {
        config.converter.format = format.into();
    }

    let mut pipeline = Pipeline::new();
    pipeline.add_stage(
        FETCHER,
        webrag_fetcher::LinkContentFetcher::new(config.fetch.clone())?,
    )?;
    pipeline.add_stage(
        CONVERTER,
        webrag_converter::HtmlToDocument::new(&config.converter),
    )?;
    pipeline.connect("fetcher.streams", "converter.streams")?;

    let inputs = PipelineInputs::new().with(FETCHER, "urls", Value::Urls(urls));
    let output = run_with_progress(&pipeline, inputs).await?;

    if let Some(failures) = output.get(FETCHER, "failures").and_then(Value::as_failures) {
        for failure in failures {
            eprintln!("  failed {}: {}", failure.url, failure.message);
        }
    }

    let documents = output
        .get(CONVERTER, "documents")
        .and_then(Value::as_documents)
        .unwrap_or_default();
    for doc in documents {
        print_document(doc);
    }

    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

async fn run_with_progress(pipeline: &Pipeline, inputs: PipelineInputs) -> Result<PipelineOutput> {
    let progress = CliProgress::new();
    let result = pipeline.run(inputs, &progress).await;
    progress.finish();
    Ok(result?)
}

fn print_answer(output: &PipelineOutput, as_json: bool) -> Result<()> {
    if as_json {
        let replies = output.get(LLM, "replies").and_then(Value::as_replies);
        let meta = output.get(LLM, "meta").and_then(Value::as_reply_meta);
        let failures = output.get(FETCHER, "failures").and_then(Value::as_failures);
        let report = json!({
            "run_id": output.run_id().to_string(),
            "answer": demo::answer(output),
            "replies": replies,
            "meta": meta,
            "failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let answer = demo::answer(output).ok_or_else(|| eyre!("the model returned no answer"))?;
    println!("{}", answer.trim());
    Ok(())
}

fn print_document(doc: &Document) {
    let meta_str = |key: &str| doc.meta().get(key).and_then(|v| v.as_str()).unwrap_or("");
    println!("--- {}", meta_str("url"));
    if let Some(error) = doc.meta().get("conversion_error").and_then(|v| v.as_str()) {
        println!("(not converted: {error})");
    } else {
        let words = doc.meta().get("word_count").and_then(|v| v.as_u64()).unwrap_or(0);
        println!("title: {}  words: {words}", meta_str("title"));
        println!();
        println!("{}", doc.content());
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner showing the stage that is currently running.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl RunObserver for CliProgress {
    fn stage_started(&self, stage: &str) {
        self.spinner.set_message(format!("Running {stage}"));
    }

    fn stage_finished(&self, stage: &str, elapsed: Duration) {
        self.spinner
            .println(format!("  {stage} done in {:.1}s", elapsed.as_secs_f64()));
    }

    fn stage_failed(&self, stage: &str, _error: &RagError) {
        self.spinner.set_message(format!("{stage} failed"));
    }
}
