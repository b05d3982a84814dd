use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::DeepBriefError;
use crate::retry::RetryPolicy;

const DEFAULT_CONFIG_PATH: &str = "deepbrief.toml";
const CONFIG_PATH_ENV: &str = "DEEPBRIEF_CONFIG";

/// Top-level pipeline configuration, read once at process start.
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    pub search: SearchConfig,
    pub scrape: ScrapeConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Helper to load configuration with best-practice guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPBRIEF_CONFIG` environment variable.
    /// 3. `deepbrief.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<ResearchConfig, DeepBriefError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| DeepBriefError::config_io(candidate.clone(), err))?;
        let config: ResearchConfig = toml::from_str(&raw)
            .map_err(|err| DeepBriefError::InvalidConfiguration(err.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &ResearchConfig) -> Result<(), DeepBriefError> {
        if config.search.endpoint.trim().is_empty() {
            return Err(DeepBriefError::InvalidConfiguration(
                "search.endpoint must not be empty".into(),
            ));
        }
        if config.scrape.base_url.trim().is_empty() {
            return Err(DeepBriefError::InvalidConfiguration(
                "scrape.base_url must not be empty".into(),
            ));
        }
        if config.llm.base_url.trim().is_empty() {
            return Err(DeepBriefError::InvalidConfiguration(
                "llm.base_url must not be empty".into(),
            ));
        }
        if config.rerank.top_n == 0 {
            return Err(DeepBriefError::InvalidConfiguration(
                "rerank.top_n must be at least 1".into(),
            ));
        }
        if config.search.max_candidates < config.rerank.top_n {
            return Err(DeepBriefError::InvalidConfiguration(
                "search.max_candidates must not be smaller than rerank.top_n".into(),
            ));
        }

        // Ensure referenced environment variables exist at load time to
        // discourage inline secrets.
        config.llm.api_key()?;
        config.search.api_key()?;
        config.scrape.api_key()?;
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Full URL of the search endpoint, e.g. `https://api.example.com/search`.
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "SearchConfig::default_max_candidates")]
    pub max_candidates: usize,
}

impl SearchConfig {
    const fn default_max_candidates() -> usize {
        30
    }

    pub fn api_key(&self) -> Result<Option<SecretValue>, DeepBriefError> {
        optional_secret(&self.api_key_env)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeConfig {
    /// Base URL of the scrape/extract backend (Firecrawl-compatible).
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "ScrapeConfig::default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "ScrapeConfig::default_concurrency")]
    pub concurrency: usize,
}

impl ScrapeConfig {
    const fn default_max_chars() -> usize {
        8_000
    }

    const fn default_concurrency() -> usize {
        6
    }

    pub fn api_key(&self) -> Result<Option<SecretValue>, DeepBriefError> {
        optional_secret(&self.api_key_env)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: String,
    #[serde(default = "LlmConfig::default_api_key_env")]
    pub api_key_env: String,
}

impl LlmConfig {
    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    pub fn api_key(&self) -> Result<Option<SecretValue>, DeepBriefError> {
        optional_secret(&self.api_key_env)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "RerankConfig::default_model")]
    pub model: String,
    #[serde(default = "RerankConfig::default_top_n")]
    pub top_n: usize,
}

impl RerankConfig {
    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }

    const fn default_top_n() -> usize {
        8
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            top_n: Self::default_top_n(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "SynthesisConfig::default_model")]
    pub model: String,
    /// Overrides the built-in brief-structure system prompt when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl SynthesisConfig {
    fn default_model() -> String {
        "gpt-4o".to_string()
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "RetryConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryConfig {
    const fn default_max_attempts() -> usize {
        3
    }

    const fn default_base_delay_ms() -> u64 {
        400
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Wall-clock ceiling for a whole pipeline run.
    #[serde(default = "LimitsConfig::default_deadline_secs")]
    pub deadline_secs: u64,
    /// Upper bound on driver iterations; guarantees termination.
    #[serde(default = "LimitsConfig::default_step_budget")]
    pub step_budget: usize,
}

impl LimitsConfig {
    const fn default_deadline_secs() -> u64 {
        120
    }

    const fn default_step_budget() -> usize {
        12
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            deadline_secs: Self::default_deadline_secs(),
            step_budget: Self::default_step_budget(),
        }
    }
}

/// An API key resolved from the environment. Never printed.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Resolve a required secret from the named environment variable.
pub fn require_env(name: &str) -> Result<SecretValue, DeepBriefError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value)),
        _ => Err(DeepBriefError::MissingSecret(name.to_string())),
    }
}

/// An empty `api_key_env` means the backend is unauthenticated.
fn optional_secret(name: &str) -> Result<Option<SecretValue>, DeepBriefError> {
    if name.trim().is_empty() {
        return Ok(None);
    }
    require_env(name).map(Some)
}
