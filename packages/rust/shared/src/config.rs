//! Application configuration for Concierge.
//!
//! User config lives at `~/.concierge/concierge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConciergeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "concierge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".concierge";

// ---------------------------------------------------------------------------
// Config structs (matching concierge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenAI-compatible model endpoint settings.
    #[serde(default)]
    pub models: ModelsConfig,

    /// Crawl policy: allow/deny patterns, seeds, robots behavior.
    #[serde(default)]
    pub policy: PolicySection,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Data directory holding the database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Maximum pages dispatched for fetching per ingestion run.
    #[serde(default = "default_page_cap")]
    pub page_cap: usize,

    /// Number of concurrent fetch workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum concurrent fetches against one host.
    #[serde(default = "default_host_fanout")]
    pub host_fanout: usize,

    /// Number of chunks retrieved per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Target chunk size in characters.
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    /// Overlap carried between consecutive chunks, in characters.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap_chars: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            page_cap: default_page_cap(),
            concurrency: default_concurrency(),
            host_fanout: default_host_fanout(),
            top_k: default_top_k(),
            chunk_max_chars: default_chunk_max_chars(),
            chunk_overlap_chars: default_chunk_overlap(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.concierge/data".into()
}
fn default_page_cap() -> usize {
    2000
}
fn default_concurrency() -> usize {
    4
}
fn default_host_fanout() -> usize {
    2
}
fn default_top_k() -> usize {
    8
}
fn default_chunk_max_chars() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    120
}

/// `[models]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chat model used for answer generation.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Embedding model used for chunks and queries.
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embed_model: default_embed_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_chat_model() -> String {
    "gpt-4.1-mini".into()
}
fn default_embed_model() -> String {
    "text-embedding-3-small".into()
}

/// `[policy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Default seed URLs used when an ingestion trigger supplies none.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// URL allow patterns (glob, `*` crosses path separators).
    #[serde(default)]
    pub allow_patterns: Vec<String>,

    /// URL deny patterns. Deny always wins over allow.
    #[serde(default)]
    pub deny_patterns: Vec<String>,

    /// Whether to consult robots.txt.
    #[serde(default = "default_true")]
    pub respect_robots_txt: bool,

    /// Minimum ms between requests to the same host.
    #[serde(default = "default_crawl_delay_ms")]
    pub crawl_delay_floor_ms: u64,

    /// User-Agent presented to crawled sites and robots.txt.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            respect_robots_txt: true,
            crawl_delay_floor_ms: default_crawl_delay_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_crawl_delay_ms() -> u64 {
    2000
}
fn default_user_agent() -> String {
    concat!("ConciergeBot/", env!("CARGO_PKG_VERSION")).into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Maximum pages dispatched for fetching in one run.
    pub page_cap: usize,
    /// Number of concurrent fetch workers.
    pub concurrency: usize,
    /// Maximum concurrent fetches per host.
    pub host_fanout: usize,
    /// Target chunk size in characters.
    pub chunk_max_chars: usize,
    /// Overlap between consecutive chunks in characters.
    pub chunk_overlap_chars: usize,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            page_cap: config.defaults.page_cap,
            concurrency: config.defaults.concurrency,
            host_fanout: config.defaults.host_fanout,
            chunk_max_chars: config.defaults.chunk_max_chars,
            chunk_overlap_chars: config.defaults.chunk_overlap_chars,
        }
    }
}

/// Runtime policy configuration, loaded once per ingestion run.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Allow patterns. Empty means "permit" (the seed-host fence still applies).
    pub allow_patterns: Vec<String>,
    /// Deny patterns, checked before allow.
    pub deny_patterns: Vec<String>,
    /// Whether robots.txt is consulted at all.
    pub respect_robots_txt: bool,
    /// Floor for per-host crawl delay.
    pub crawl_delay_floor: Duration,
    /// User-Agent matched against robots.txt rules.
    pub user_agent: String,
}

impl From<&AppConfig> for PolicyConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            allow_patterns: config.policy.allow_patterns.clone(),
            deny_patterns: config.policy.deny_patterns.clone(),
            respect_robots_txt: config.policy.respect_robots_txt,
            crawl_delay_floor: Duration::from_millis(config.policy.crawl_delay_floor_ms),
            user_agent: config.policy.user_agent.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.concierge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ConciergeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.concierge/concierge.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ConciergeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ConciergeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ConciergeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ConciergeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ConciergeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.models.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ConciergeError::config(format!(
            "model API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("page_cap"));
        assert!(toml_str.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.page_cap, 2000);
        assert_eq!(parsed.defaults.top_k, 8);
        assert_eq!(parsed.models.embed_model, "text-embedding-3-small");
    }

    #[test]
    fn config_with_policy_lists() {
        let toml_str = r#"
[policy]
seeds = ["https://example.com/"]
allow_patterns = ["https://example.com/*"]
deny_patterns = ["*/archive/*"]
crawl_delay_floor_ms = 1500
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.policy.seeds.len(), 1);
        assert_eq!(config.policy.deny_patterns, vec!["*/archive/*"]);

        let policy = PolicyConfig::from(&config);
        assert_eq!(policy.crawl_delay_floor, Duration::from_millis(1500));
        assert!(policy.respect_robots_txt);
    }

    #[test]
    fn crawl_config_from_app_config() {
        let app = AppConfig::default();
        let crawl = CrawlConfig::from(&app);
        assert_eq!(crawl.page_cap, 2000);
        assert_eq!(crawl.concurrency, 4);
        assert_eq!(crawl.host_fanout, 2);
        assert_eq!(crawl.chunk_max_chars, 1000);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.models.api_key_env = "CONCIERGE_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
