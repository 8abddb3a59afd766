use crate::error::{ProxyError, Result};
use crate::models::Tier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "claude-gemini-proxy.toml";
const CONFIG_DIR_NAME: &str = "claude-gemini-proxy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub thinking: ThinkingDefaults,
    #[serde(default)]
    pub limits: TokenLimits,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_big_model")]
    pub big: String,
    #[serde(default = "default_small_model")]
    pub small: String,
    /// Substrings (case-insensitive) that route a requested model to the small tier.
    #[serde(default = "default_small_markers")]
    pub small_markers: Vec<String>,
    /// Exact requested-model → target overrides, checked before tier rules.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingDefaults {
    #[serde(default)]
    pub big: TierThinking,
    #[serde(default)]
    pub small: TierThinking,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierThinking {
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPolicy {
    #[default]
    Clamp,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLimits {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub policy: TokenPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    90
}

fn default_max_concurrent_requests() -> usize {
    64
}

fn default_safety_threshold() -> String {
    "BLOCK_NONE".to_string()
}

fn default_big_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_small_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_small_markers() -> Vec<String> {
    vec!["haiku".to_string(), "flash".to_string()]
}

const DEFAULT_BIG_THINKING_BUDGET: i64 = 5000;
const DEFAULT_SMALL_THINKING_BUDGET: i64 = 1000;

fn default_min_tokens() -> u64 {
    100
}

fn default_max_tokens() -> u64 {
    65_536
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_cache_min_chars() -> usize {
    4096
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cache_max_entries() -> usize {
    256
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: UpstreamConfig::default(),
            models: ModelsConfig::default(),
            thinking: ThinkingDefaults::default(),
            limits: TokenLimits::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_requests: default_max_concurrent_requests(),
            safety_threshold: default_safety_threshold(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            big: default_big_model(),
            small: default_small_model(),
            small_markers: default_small_markers(),
            aliases: HashMap::new(),
        }
    }
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            policy: TokenPolicy::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_chars: default_cache_min_chars(),
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl ThinkingDefaults {
    /// Default `(enabled, budget)` for requests that say nothing about thinking.
    pub fn for_tier(&self, tier: Tier) -> (bool, i64) {
        match tier {
            Tier::Big => (
                self.big.enabled,
                self.big.budget.unwrap_or(DEFAULT_BIG_THINKING_BUDGET),
            ),
            Tier::Small => (
                self.small.enabled,
                self.small.budget.unwrap_or(DEFAULT_SMALL_THINKING_BUDGET),
            ),
        }
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ProxyConfig {
    /// Load config from a TOML file. Missing sections and keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, apply environment
    /// overrides and validate. Without any file the built-in defaults apply.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::load(path)?,
            None => match config_search_paths().into_iter().find(|p| p.exists()) {
                Some(found) => {
                    tracing::info!(path = %found.display(), "Loading config");
                    Self::load(&found)?
                }
                None => {
                    tracing::info!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KEY=value` overrides. `lookup` is normally the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("GEMINI_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = lookup("BIG_MODEL") {
            self.models.big = v;
        }
        if let Some(v) = lookup("SMALL_MODEL") {
            self.models.small = v;
        }
        if let Some(v) = parse_override(&lookup, "BIG_MODEL_THINKING_BUDGET")? {
            self.thinking.big.budget = Some(v);
        }
        if let Some(v) = parse_override(&lookup, "SMALL_MODEL_THINKING_BUDGET")? {
            self.thinking.small.budget = Some(v);
        }
        if let Some(v) = parse_bool_override(&lookup, "ENABLE_THINKING_BY_DEFAULT")? {
            self.thinking.big.enabled = v;
            self.thinking.small.enabled = v;
        }
        if let Some(v) = parse_override(&lookup, "MAX_TOKENS_LIMIT")? {
            self.limits.max_tokens = v;
        }
        if let Some(v) = parse_override(&lookup, "MIN_TOKENS_LIMIT")? {
            self.limits.min_tokens = v;
        }
        if let Some(v) = parse_override(&lookup, "REQUEST_TIMEOUT")? {
            self.upstream.request_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_bool_override(&lookup, "ENABLE_CONTENT_CACHE")? {
            self.cache.enabled = v;
        }
        if let Some(v) = parse_override(&lookup, "CACHE_MIN_CHARS")? {
            self.cache.min_chars = v;
        }
        if let Some(hours) = parse_override::<u64>(&lookup, "CACHE_TTL_HOURS")? {
            self.cache.ttl_secs = hours.checked_mul(60 * 60).ok_or_else(|| {
                ProxyError::config(format!("CACHE_TTL_HOURS={hours} is too large"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(ProxyError::config("upstream.base_url must not be empty"));
        }
        if self.upstream.max_concurrent_requests == 0 {
            return Err(ProxyError::config(
                "upstream.max_concurrent_requests must be at least 1",
            ));
        }
        if self.upstream.request_timeout_secs == 0 {
            return Err(ProxyError::config(
                "upstream.request_timeout_secs must be at least 1",
            ));
        }
        if self.limits.min_tokens > self.limits.max_tokens {
            return Err(ProxyError::config(format!(
                "limits.min_tokens ({}) exceeds limits.max_tokens ({})",
                self.limits.min_tokens, self.limits.max_tokens
            )));
        }
        if self.models.big.trim().is_empty() || self.models.small.trim().is_empty() {
            return Err(ProxyError::config("models.big and models.small must be set"));
        }
        Ok(())
    }

    /// Resolve the API key from the configured environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        match std::env::var(&self.upstream.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ProxyError::config(format!(
                "Environment variable '{}' not set. Set it with your Gemini API key.",
                self.upstream.api_key_env
            ))),
        }
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProxyError::config(format!("{key}: cannot parse '{raw}'"))),
    }
}

fn parse_bool_override(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ProxyError::config(format!(
                "{key}: expected a boolean, got '{raw}'"
            ))),
        },
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from(CONFIG_FILE_NAME));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join(CONFIG_DIR_NAME)
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join(CONFIG_DIR_NAME).join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join(CONFIG_DIR_NAME).join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = home_dir() {
        paths.push(home.join(format!(".{CONFIG_FILE_NAME}")));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
