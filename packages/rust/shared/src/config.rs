//! Application configuration for Oncall Lens.
//!
//! User config lives at `~/.oncall-lens/oncall-lens.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{OncallError, Result};
use crate::types::Stage;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "oncall-lens.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".oncall-lens";

// ---------------------------------------------------------------------------
// Config structs (matching oncall-lens.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM completion provider.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Retrieval engine and local knowledge base.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Optional reranker pass.
    #[serde(default)]
    pub reranker: RerankerConfig,

    /// Stage bands and per-call timeouts.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Task registry lifecycle.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Artifact acceptance rules.
    #[serde(default)]
    pub upload: UploadConfig,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Retries on transient failures (transport errors, 429, 5xx).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff, doubled after each retry.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_api_key_env(),
            base_url: default_llm_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    500
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Directory of Markdown postmortems.
    #[serde(default = "default_kb_path")]
    pub knowledge_base_path: String,

    /// Named weight configuration: "hybrid", "ensemble", or a single strategy name.
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Explicit strategy weights; overrides `preset` when non-empty.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub weights: BTreeMap<String, f64>,

    /// Documents kept after fusion.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Candidates requested from each strategy before fusion.
    #[serde(default = "default_candidates")]
    pub candidates_per_strategy: usize,

    #[serde(default = "default_strategy_timeout")]
    pub strategy_timeout_secs: u64,

    /// Child chunk size (characters) for chunk-level strategies.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Alternative phrasings requested by the multi-query strategy.
    #[serde(default = "default_variants")]
    pub multi_query_variants: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_base_path: default_kb_path(),
            preset: default_preset(),
            weights: BTreeMap::new(),
            top_k: default_top_k(),
            candidates_per_strategy: default_candidates(),
            strategy_timeout_secs: default_strategy_timeout(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            multi_query_variants: default_variants(),
        }
    }
}

impl RetrievalConfig {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout_secs)
    }
}

fn default_kb_path() -> String {
    "./data/knowledge-base".into()
}
fn default_preset() -> String {
    "hybrid".into()
}
fn default_top_k() -> usize {
    5
}
fn default_candidates() -> usize {
    10
}
fn default_strategy_timeout() -> u64 {
    10
}
fn default_chunk_size() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_variants() -> usize {
    3
}

/// `[reranker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Name of the env var holding the reranker API key.
    #[serde(default = "default_rerank_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_rerank_base_url")]
    pub base_url: String,

    #[serde(default = "default_rerank_model")]
    pub model: String,

    /// Only the top-N fused candidates are re-scored.
    #[serde(default = "default_rerank_top_n")]
    pub top_n: usize,

    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key_env: default_rerank_api_key_env(),
            base_url: default_rerank_base_url(),
            model: default_rerank_model(),
            top_n: default_rerank_top_n(),
            timeout_secs: default_rerank_timeout(),
        }
    }
}

impl RerankerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_rerank_api_key_env() -> String {
    "COHERE_API_KEY".into()
}
fn default_rerank_base_url() -> String {
    "https://api.cohere.com/v2".into()
}
fn default_rerank_model() -> String {
    "rerank-v3.5".into()
}
fn default_rerank_top_n() -> usize {
    10
}
fn default_rerank_timeout() -> u64 {
    15
}

/// A stage's share of overall progress, as inclusive percentage bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub start: u8,
    pub end: u8,
}

impl Band {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Map a stage-local fraction (clamped to `[0, 1]`) into this band.
    pub fn at(&self, fraction: f64) -> u8 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let span = f64::from(self.end.saturating_sub(self.start));
        self.start + (span * fraction).floor() as u8
    }
}

/// Percentage bands for the four working stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageBands {
    #[serde(default = "default_triage_band")]
    pub triage: Band,
    #[serde(default = "default_historical_band")]
    pub historical_search: Band,
    #[serde(default = "default_root_cause_band")]
    pub root_cause: Band,
    #[serde(default = "default_synthesis_band")]
    pub synthesis: Band,
}

impl Default for StageBands {
    fn default() -> Self {
        Self {
            triage: default_triage_band(),
            historical_search: default_historical_band(),
            root_cause: default_root_cause_band(),
            synthesis: default_synthesis_band(),
        }
    }
}

impl StageBands {
    /// Band owned by `stage`; `None` for the non-working states.
    pub fn band(&self, stage: Stage) -> Option<Band> {
        match stage {
            Stage::Triage => Some(self.triage),
            Stage::HistoricalSearch => Some(self.historical_search),
            Stage::RootCause => Some(self.root_cause),
            Stage::Synthesis => Some(self.synthesis),
            Stage::Created | Stage::Done | Stage::Failed => None,
        }
    }

    /// Bands must tile 0..=100 in stage order without gaps or overlap.
    pub fn validate(&self) -> Result<()> {
        let ordered = [
            self.triage,
            self.historical_search,
            self.root_cause,
            self.synthesis,
        ];
        if ordered[0].start != 0 {
            return Err(OncallError::config("triage band must start at 0"));
        }
        if ordered[3].end != 100 {
            return Err(OncallError::config("synthesis band must end at 100"));
        }
        for band in &ordered {
            if band.start > band.end {
                return Err(OncallError::config(format!(
                    "band {}..{} is inverted",
                    band.start, band.end
                )));
            }
        }
        for pair in ordered.windows(2) {
            if pair[0].end != pair[1].start {
                return Err(OncallError::config(format!(
                    "bands must be contiguous: {} does not meet {}",
                    pair[0].end, pair[1].start
                )));
            }
        }
        Ok(())
    }
}

fn default_triage_band() -> Band {
    Band::new(0, 25)
}
fn default_historical_band() -> Band {
    Band::new(25, 50)
}
fn default_root_cause_band() -> Band {
    Band::new(50, 75)
}
fn default_synthesis_band() -> Band {
    Band::new(75, 100)
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub bands: StageBands,

    /// Per-artifact extraction deadline.
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_secs: u64,

    /// Deadline for one LLM call as seen by a stage, retries included.
    #[serde(default = "default_stage_llm_timeout")]
    pub llm_timeout_secs: u64,

    /// Upper bound on retrieval queries built from one triage summary.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bands: StageBands::default(),
            extraction_timeout_secs: default_extraction_timeout(),
            llm_timeout_secs: default_stage_llm_timeout(),
            max_queries: default_max_queries(),
        }
    }
}

impl PipelineConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

fn default_extraction_timeout() -> u64 {
    30
}
fn default_stage_llm_timeout() -> u64 {
    300
}
fn default_max_queries() -> usize {
    3
}

/// `[registry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Completed tasks older than this are swept.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Per-task event buffer; slow subscribers resync from the snapshot.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Subscriber-side inactivity window before `StalledTask` is raised.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            channel_capacity: default_channel_capacity(),
            stall_timeout_secs: default_stall_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_ttl() -> u64 {
    3600
}
fn default_channel_capacity() -> usize {
    64
}
fn default_stall_timeout() -> u64 {
    120
}
fn default_sweep_interval() -> u64 {
    60
}

/// `[upload]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum artifact size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,

    /// Accepted file extensions, lowercase with leading dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_max_file_size() -> usize {
    10 * 1024 * 1024
}
fn default_allowed_extensions() -> Vec<String> {
    [
        ".txt", ".log", ".diff", ".patch", ".json", ".md", ".csv", ".html", ".htm", ".png",
        ".jpg", ".jpeg",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check cross-field invariants that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.bands.validate()?;

        Url::parse(&self.llm.base_url)
            .map_err(|e| OncallError::config(format!("invalid llm.base_url: {e}")))?;
        if self.reranker.enabled {
            Url::parse(&self.reranker.base_url)
                .map_err(|e| OncallError::config(format!("invalid reranker.base_url: {e}")))?;
        }

        if self.pipeline.llm_timeout_secs == 0 {
            return Err(OncallError::config("pipeline.llm_timeout_secs must be at least 1"));
        }

        if self.retrieval.top_k == 0 {
            return Err(OncallError::config("retrieval.top_k must be at least 1"));
        }
        if self.retrieval.chunk_overlap >= self.retrieval.chunk_size {
            return Err(OncallError::config(
                "retrieval.chunk_overlap must be smaller than retrieval.chunk_size",
            ));
        }
        for (name, weight) in &self.retrieval.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(OncallError::config(format!(
                    "retrieval.weights.{name} must be a non-negative number"
                )));
            }
        }
        if !self.retrieval.weights.is_empty()
            && self.retrieval.weights.values().all(|w| *w == 0.0)
        {
            return Err(OncallError::config("retrieval.weights must not all be zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.oncall-lens/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| OncallError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.oncall-lens/oncall-lens.toml`).
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

/// Load the application config from a specific file path and validate it.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| OncallError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        OncallError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| OncallError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| OncallError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| OncallError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}

/// Load from `path` when given, else from the default location. A missing
/// file yields defaults either way.
pub fn load_config_or_default(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) if path.exists() => load_config_from(path),
        Some(path) => {
            tracing::debug!(?path, "config file not found, using defaults");
            Ok(AppConfig::default())
        }
        None => load_config(),
    }
}

/// Read the API key named by `var_name`, failing with a helpful message.
pub fn resolve_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(OncallError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that the LLM API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    resolve_api_key(&config.llm.api_key_env).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("knowledge_base_path"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.retrieval.top_k, 5);
        assert_eq!(parsed.pipeline.bands.root_cause, Band::new(50, 75));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn config_with_custom_weights() {
        let toml_str = r#"
[retrieval]
preset = "ensemble"

[retrieval.weights]
lexical = 1.0
semantic = 0.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.retrieval.weights.len(), 2);
        assert_eq!(config.retrieval.weights["lexical"], 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn all_zero_weights_rejected() {
        let mut config = AppConfig::default();
        config.retrieval.weights.insert("lexical".into(), 0.0);
        config.retrieval.weights.insert("semantic".into(), 0.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not all be zero"));
    }

    #[test]
    fn negative_weight_rejected() {
        let mut config = AppConfig::default();
        config.retrieval.weights.insert("lexical".into(), -0.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn gapped_bands_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.bands.historical_search = Band::new(30, 50);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }

    #[test]
    fn zero_llm_deadline_rejected() {
        let mut config = AppConfig::default();
        assert_eq!(config.pipeline.llm_timeout(), Duration::from_secs(300));
        config.pipeline.llm_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("llm_timeout_secs"));
    }

    #[test]
    fn band_maps_fractions() {
        let band = Band::new(25, 50);
        assert_eq!(band.at(0.0), 25);
        assert_eq!(band.at(0.5), 37);
        assert_eq!(band.at(1.0), 50);
        assert_eq!(band.at(7.0), 50);
        assert_eq!(band.at(f64::NAN), 25);
    }

    #[test]
    fn init_then_load_from_custom_path() {
        let dir = std::env::temp_dir().join(format!("oncall-lens-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("oncall-lens.toml");

        let missing = load_config_or_default(Some(&path)).expect("defaults");
        assert_eq!(missing.retrieval.preset, "hybrid");

        init_config_at(&path).expect("write config");
        let loaded = load_config_or_default(Some(&path)).expect("load");
        assert_eq!(loaded.registry.ttl_secs, 3600);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.llm.api_key_env = "ONCALL_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
