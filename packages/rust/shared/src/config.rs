//! Application configuration for webrag.
//!
//! User config lives at `~/.webrag/webrag.toml`.
//! CLI flags override config file values, which override defaults.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "webrag.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".webrag";

// ---------------------------------------------------------------------------
// Config structs (matching webrag.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM endpoint settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Fetcher settings.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// BM25 retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// HTML conversion settings.
    #[serde(default)]
    pub converter: ConverterConfig,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the OpenAI-compatible API (without `/chat/completions`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature; endpoint default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Per-request timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Retries on transient failures. Zero disables retrying.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
            temperature: None,
            timeout_secs: default_llm_timeout(),
            max_retries: 0,
        }
    }
}

fn default_api_key_env() -> String {
    "SAMBANOVA_API_KEY".into()
}
fn default_model() -> String {
    "Meta-Llama-3.1-8B-Instruct".into()
}
fn default_base_url() -> String {
    "https://api.sambanova.ai/v1".into()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_llm_timeout() -> u64 {
    60
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Redirects followed before giving up.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Permit loopback and private-range hosts (local testing only).
    #[serde(default)]
    pub allow_private_hosts: bool,

    /// Abort the whole batch on the first failed URL instead of skipping it.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
            allow_private_hosts: false,
            fail_fast: false,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_redirects() -> usize {
    5
}
fn default_user_agent() -> String {
    concat!("webrag/", env!("CARGO_PKG_VERSION")).into()
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Documents handed to the prompt builder.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// BM25 term-frequency saturation.
    #[serde(default = "default_k1")]
    pub k1: f64,

    /// BM25 length normalisation.
    #[serde(default = "default_b")]
    pub b: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            k1: default_k1(),
            b: default_b(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_k1() -> f64 {
    1.5
}
fn default_b() -> f64 {
    0.75
}

/// Output format of the HTML converter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Text,
}

/// `[converter]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConverterConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// An API key handed explicitly to the generator. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a secret, rejecting empty or whitespace-only values.
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(RagError::configuration("API key must not be empty"));
        }
        Ok(Self(secret))
    }

    /// The raw secret, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Read the API key named by `config.api_key_env` from the environment.
///
/// Fails with [`RagError::Configuration`] when the variable is unset or empty.
pub fn load_credential(config: &LlmConfig) -> Result<Credential> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Credential::new(val),
        _ => Err(RagError::configuration(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.webrag/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RagError::configuration("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.webrag/webrag.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RagError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| RagError::configuration(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RagError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RagError::configuration(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RagError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("SAMBANOVA_API_KEY"));
        assert!(toml_str.contains("https://api.sambanova.ai/v1"));
        assert!(toml_str.contains("format = \"markdown\""));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.retrieval.top_k, 3);
        assert_eq!(parsed.llm.max_retries, 0);
        assert_eq!(parsed.fetch.max_redirects, 5);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[llm]
model = "Meta-Llama-3.3-70B-Instruct"
max_retries = 2

[converter]
format = "text"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.llm.model, "Meta-Llama-3.3-70B-Instruct");
        assert_eq!(config.llm.max_retries, 2);
        assert_eq!(config.llm.api_key_env, "SAMBANOVA_API_KEY");
        assert_eq!(config.converter.format, OutputFormat::Text);
        assert!(!config.fetch.fail_fast);
    }

    #[test]
    fn load_config_from_reports_parse_errors() {
        let dir = std::env::temp_dir().join(format!("webrag-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("broken.toml");
        std::fs::write(&path, "[llm\nmodel = ").expect("write");

        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, RagError::Configuration { .. }));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let config = LlmConfig {
            // Use a unique env var name to avoid interfering with other tests
            api_key_env: "WEBRAG_TEST_NONEXISTENT_KEY_12345".into(),
            ..LlmConfig::default()
        };
        let err = load_credential(&config).unwrap_err();
        assert!(matches!(err, RagError::Configuration { .. }));
        assert!(err.to_string().contains("WEBRAG_TEST_NONEXISTENT_KEY_12345"));
    }

    #[test]
    fn credential_rejects_blank_and_redacts() {
        assert!(Credential::new("   ").is_err());

        let cred = Credential::new("sk-secret").expect("valid key");
        assert_eq!(cred.expose(), "sk-secret");
        assert!(!format!("{cred:?}").contains("sk-secret"));
    }
}
