//! Application configuration for RecordFlow.
//!
//! User config lives at `~/.recordflow/recordflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RecordFlowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "recordflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".recordflow";

// ---------------------------------------------------------------------------
// Config structs (matching recordflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Input/output/state file locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Worker pool and stage policy.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Crawl bounds and link heuristics.
    #[serde(default)]
    pub crawl: CrawlSection,

    /// Directory service settings and match rules.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Research / synthesis / ranking collaborator endpoint.
    #[serde(default)]
    pub services: ServicesConfig,

    /// Per-million-unit pricing used for cost estimates.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Asset refinement limits.
    #[serde(default)]
    pub refine: RefineConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_input")]
    pub input: PathBuf,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default = "default_retry")]
    pub retry: PathBuf,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,
    /// Root of the per-domain crawl content store.
    #[serde(default = "default_content_store")]
    pub content_store: PathBuf,
    /// Directory holding one JSON file per directory-lookup query hash.
    #[serde(default = "default_directory_cache")]
    pub directory_cache: PathBuf,
    /// Downloaded listing photos, one subdirectory per directory listing.
    #[serde(default = "default_listing_images")]
    pub listing_images: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input: default_input(),
            output: default_output(),
            retry: default_retry(),
            checkpoint: default_checkpoint(),
            content_store: default_content_store(),
            directory_cache: default_directory_cache(),
            listing_images: default_listing_images(),
        }
    }
}

fn default_input() -> PathBuf {
    "data/unified_records.jsonl".into()
}
fn default_output() -> PathBuf {
    "data/output.jsonl".into()
}
fn default_retry() -> PathBuf {
    "data/retry.jsonl".into()
}
fn default_checkpoint() -> PathBuf {
    "data/processing_state.json".into()
}
fn default_content_store() -> PathBuf {
    "data/scraped_content".into()
}
fn default_directory_cache() -> PathBuf {
    "data/directory_cache".into()
}
fn default_listing_images() -> PathBuf {
    "data/images".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds between progress reports.
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Drop records that have no usable website instead of continuing
    /// with an empty crawl payload.
    #[serde(default)]
    pub require_website: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            progress_interval_secs: default_progress_interval(),
            require_website: false,
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_progress_interval() -> u64 {
    5
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,
    #[serde(default = "default_asset_timeout")]
    pub asset_timeout_secs: u64,
    /// Page text at or below this many characters is discarded.
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    /// Images wider than this are downscaled.
    #[serde(default = "default_max_image_width")]
    pub max_image_width: u32,
    #[serde(default = "default_priority_keywords")]
    pub priority_keywords: Vec<String>,
    #[serde(default = "default_ignored_keywords")]
    pub ignored_keywords: Vec<String>,
    /// Allow crawling loopback/private hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            page_timeout_secs: default_page_timeout(),
            asset_timeout_secs: default_asset_timeout(),
            min_text_chars: default_min_text_chars(),
            max_image_width: default_max_image_width(),
            priority_keywords: default_priority_keywords(),
            ignored_keywords: default_ignored_keywords(),
            allow_private_hosts: false,
        }
    }
}

fn default_max_pages() -> usize {
    15
}
fn default_max_depth() -> u32 {
    3
}
fn default_page_timeout() -> u64 {
    30
}
fn default_asset_timeout() -> u64 {
    10
}
fn default_min_text_chars() -> usize {
    100
}
fn default_max_image_width() -> u32 {
    1000
}
fn default_priority_keywords() -> Vec<String> {
    [
        "about",
        "program",
        "curriculum",
        "tuition",
        "contact",
        "gallery",
        "admission",
        "staff",
        "team",
        "philosophy",
        "schedule",
    ]
    .map(String::from)
    .to_vec()
}
fn default_ignored_keywords() -> Vec<String> {
    [
        "blog",
        "news",
        "event",
        "calendar",
        "login",
        "portal",
        "parent-portal",
        "career",
        "job",
        "policy",
        "terms",
        "privacy",
    ]
    .map(String::from)
    .to_vec()
}

/// `[identity]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Name of the env var holding the directory API key (never store the key itself).
    #[serde(default = "default_places_key_env")]
    pub api_key_env: String,

    /// Directory service base URL.
    #[serde(default = "default_places_base_url")]
    pub base_url: String,

    /// Minimum name similarity ratio when containment does not apply.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Listing photos downloaded per new match (0 disables).
    #[serde(default = "default_max_photos")]
    pub max_photos: usize,

    /// Download a street-level image of each new match.
    #[serde(default = "default_true")]
    pub street_view: bool,

    /// Street-level imagery endpoint.
    #[serde(default = "default_street_view_url")]
    pub street_view_url: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_places_key_env(),
            base_url: default_places_base_url(),
            similarity_threshold: default_similarity_threshold(),
            max_photos: default_max_photos(),
            street_view: true,
            street_view_url: default_street_view_url(),
        }
    }
}

fn default_places_key_env() -> String {
    "GOOGLE_PLACES_API_KEY".into()
}
fn default_places_base_url() -> String {
    "https://maps.googleapis.com/maps/api/place".into()
}
fn default_similarity_threshold() -> f64 {
    0.3
}
fn default_max_photos() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_street_view_url() -> String {
    "https://maps.googleapis.com/maps/api/streetview".into()
}

/// `[services]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Base URL of the enrichment gateway (`/research`, `/synthesize`, `/rank`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Name of the env var holding the gateway API key.
    #[serde(default = "default_services_key_env")]
    pub api_key_env: String,

    /// Per-request timeout.
    #[serde(default = "default_services_timeout")]
    pub timeout_secs: u64,

    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_services_key_env(),
            timeout_secs: default_services_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_services_key_env() -> String {
    "ENRICHMENT_API_KEY".into()
}
fn default_services_timeout() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30_000
}

/// USD per one million input/output units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// `[pricing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Rate applied to stages without an override.
    #[serde(default = "default_rate")]
    pub default: Rate,

    /// Per-stage overrides keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, Rate>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default: default_rate(),
            stages: BTreeMap::new(),
        }
    }
}

fn default_rate() -> Rate {
    Rate {
        input_per_million: 0.50,
        output_per_million: 3.00,
    }
}

/// `[refine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    #[serde(default = "default_image_top_n")]
    pub image_top_n: usize,
    #[serde(default = "default_document_top_n")]
    pub document_top_n: usize,
    /// Consolidated page text is truncated beyond this many characters.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            image_top_n: default_image_top_n(),
            document_top_n: default_document_top_n(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

fn default_image_top_n() -> usize {
    10
}
fn default_document_top_n() -> usize {
    5
}
fn default_max_text_chars() -> usize {
    100_000
}

// ---------------------------------------------------------------------------
// Crawl config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Maximum number of pages visited per domain.
    pub max_pages: usize,
    /// Maximum link depth from the root URL.
    pub max_depth: u32,
    /// Timeout for a single page fetch.
    pub page_timeout_secs: u64,
    /// Timeout for a single asset download.
    pub asset_timeout_secs: u64,
    /// Minimum characters of page text worth keeping.
    pub min_text_chars: usize,
    /// Maximum stored image width in pixels.
    pub max_image_width: u32,
    /// Path keywords that are always followed.
    pub priority_keywords: Vec<String>,
    /// Path keywords that are never followed.
    pub ignored_keywords: Vec<String>,
    /// Whether loopback/private hosts may be fetched.
    pub allow_private_hosts: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        let crawl = &config.crawl;
        Self {
            max_pages: crawl.max_pages,
            max_depth: crawl.max_depth,
            page_timeout_secs: crawl.page_timeout_secs,
            asset_timeout_secs: crawl.asset_timeout_secs,
            min_text_chars: crawl.min_text_chars,
            max_image_width: crawl.max_image_width,
            priority_keywords: crawl.priority_keywords.clone(),
            ignored_keywords: crawl.ignored_keywords.clone(),
            allow_private_hosts: crawl.allow_private_hosts,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.recordflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RecordFlowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.recordflow/recordflow.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| RecordFlowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        RecordFlowError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RecordFlowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RecordFlowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RecordFlowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values that would make the pipeline misbehave.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.pipeline.workers == 0 {
        return Err(RecordFlowError::config("pipeline.workers must be at least 1"));
    }
    if config.crawl.max_pages == 0 {
        return Err(RecordFlowError::config("crawl.max_pages must be at least 1"));
    }
    if !(0.0..=1.0).contains(&config.identity.similarity_threshold) {
        return Err(RecordFlowError::config(
            "identity.similarity_threshold must be between 0.0 and 1.0",
        ));
    }
    if config.services.max_attempts == 0 {
        return Err(RecordFlowError::config("services.max_attempts must be at least 1"));
    }
    Ok(())
}

/// Read an API key from the env var named in config.
pub fn read_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(RecordFlowError::config(format!(
            "API key not found. Set the {var_name} environment variable."
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
        assert!(toml_str.contains("content_store"));
        assert!(toml_str.contains("GOOGLE_PLACES_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.crawl.max_depth, 3);
        assert_eq!(parsed.crawl.max_pages, 15);
        assert_eq!(parsed.identity.similarity_threshold, 0.3);
        assert_eq!(parsed.identity.max_photos, 5);
        assert!(parsed.identity.street_view);
        assert_eq!(parsed.pricing.default.output_per_million, 3.00);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pipeline]
workers = 8

[crawl]
max_pages = 5

[pricing.stages.finalize]
input_per_million = 1.0
output_per_million = 4.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.progress_interval_secs, 5);
        assert_eq!(config.crawl.max_pages, 5);
        assert_eq!(config.crawl.max_depth, 3);
        assert!(config.crawl.priority_keywords.contains(&"tuition".to_string()));
        assert_eq!(config.pricing.stages["finalize"].input_per_million, 1.0);
    }

    #[test]
    fn crawl_config_from_app_config() {
        let app = AppConfig::default();
        let crawl = CrawlConfig::from(&app);
        assert_eq!(crawl.max_depth, 3);
        assert_eq!(crawl.max_pages, 15);
        assert_eq!(crawl.max_image_width, 1000);
        assert!(!crawl.allow_private_hosts);
    }

    #[test]
    fn validation_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.pipeline.workers = 0;
        assert!(validate_config(&config).is_err());
        config.pipeline.workers = 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn api_key_lookup() {
        // Use a unique env var name to avoid interfering with other tests
        let result = read_api_key("RF_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
