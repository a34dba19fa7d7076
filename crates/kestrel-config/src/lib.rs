//! Kestrel Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const TOKEN_ENV_VAR: &str = "KESTREL_TELEGRAM_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    pub knowledge_base_dir: Option<String>,
    /// Markdown file prepended to every system prompt.
    pub persona_file: Option<String>,
    #[serde(default)]
    pub bot_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    #[serde(default)]
    pub accounts: Vec<TelegramAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramAccount {
    pub bot_token: String,
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub allowed_chats: Option<Vec<i64>>,
}

impl TelegramAccount {
    pub fn account_tag(&self) -> String {
        telegram_account_tag(&self.bot_token)
    }

    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&chat_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Ollama,
    Openai,
    Command,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Openai => "openai",
            Self::Command => "command",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub default_provider: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    pub retry: Option<RetryPolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Executable for `kind = "command"`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub options: GenerationOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub num_thread: Option<u32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            num_predict: default_num_predict(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            num_thread: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub window_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
    pub backoff_factor: Option<u32>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub chromium_path: Option<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_capture_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default)]
    pub ignore_hosts: Vec<String>,
    #[serde(default)]
    pub steps: Vec<CaptureStepConfig>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chromium_path: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            settle_ms: default_settle_ms(),
            max_entries: default_capture_max_entries(),
            max_body_chars: default_max_body_chars(),
            ignore_hosts: Vec::new(),
            steps: Vec::new(),
        }
    }
}

/// One click in the capture sequence. Selectors are tried in order and the
/// first element present on the page is clicked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStepConfig {
    pub name: String,
    #[serde(default)]
    pub selectors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fetch_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_chars: default_fetch_max_chars(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub allowlist: Option<Vec<String>>,
    pub denylist: Option<Vec<String>>,
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub messages_per_minute: u32,
}

pub fn telegram_account_tag(bot_token: &str) -> String {
    let token = bot_token.trim();
    token.split(':').next().unwrap_or(token).trim().to_string()
}

/// Expands a leading `~` to the home directory.
pub fn expand_user_path(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest);
    }
    PathBuf::from(path)
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_num_predict() -> u32 {
    1024
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    512
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_navigation_timeout_secs() -> u64 {
    45
}

fn default_settle_ms() -> u64 {
    2500
}

fn default_capture_max_entries() -> usize {
    60
}

fn default_max_body_chars() -> usize {
    400
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_fetch_max_chars() -> usize {
    10_000
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_token_override(std::env::var(TOKEN_ENV_VAR).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kestrel").join("config.toml"))
    }

    /// Replaces the first Telegram account token (or adds an account) when a
    /// non-empty token is supplied through the environment.
    pub fn apply_token_override(&mut self, token: Option<String>) {
        let Some(token) = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) else {
            return;
        };

        let telegram = self.telegram.get_or_insert_with(TelegramConfig::default);
        match telegram.accounts.first_mut() {
            Some(account) => account.bot_token = token,
            None => telegram.accounts.push(TelegramAccount {
                bot_token: token,
                ..TelegramAccount::default()
            }),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.core.data_dir {
            Some(dir) => expand_user_path(dir),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".kestrel"),
        }
    }

    pub fn knowledge_base_dir(&self) -> PathBuf {
        match &self.core.knowledge_base_dir {
            Some(dir) => expand_user_path(dir),
            None => self.data_dir().join("knowledge_base"),
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.backend.providers.iter().find(|p| p.name == name)
    }

    pub fn default_provider(&self) -> Option<&ProviderConfig> {
        if self.backend.default_provider.is_empty() {
            self.backend.providers.first()
        } else {
            self.provider(&self.backend.default_provider)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut provider_names = HashSet::new();
        for provider in &self.backend.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                anyhow::bail!("Provider name cannot be empty");
            }
            if !provider_names.insert(name.to_string()) {
                anyhow::bail!("Duplicate provider name '{}'", name);
            }

            if provider.kind == ProviderKind::Command {
                let command = provider.command.as_deref().map(str::trim).unwrap_or("");
                if command.is_empty() {
                    anyhow::bail!(
                        "Provider '{}' has kind=command but no command is set",
                        name
                    );
                }
            }

            if let Some(timeout) = provider.timeout_secs {
                if timeout == 0 {
                    anyhow::bail!("Provider '{}' timeout_secs must be > 0", name);
                }
            }
        }

        if !self.backend.default_provider.is_empty()
            && !provider_names.contains(&self.backend.default_provider)
        {
            anyhow::bail!(
                "default_provider '{}' is not defined in backend.providers",
                self.backend.default_provider
            );
        }

        if let Some(retry) = &self.backend.retry {
            if retry.window_secs == Some(0) {
                anyhow::bail!("backend.retry.window_secs must be > 0");
            }
            if retry.initial_delay_secs == Some(0) {
                anyhow::bail!("backend.retry.initial_delay_secs must be > 0");
            }
            if retry.backoff_factor == Some(0) {
                anyhow::bail!("backend.retry.backoff_factor must be >= 1");
            }
            if retry.max_delay_secs == Some(0) {
                anyhow::bail!("backend.retry.max_delay_secs must be > 0");
            }
        }

        if let Some(telegram) = &self.telegram {
            let mut account_tags = HashSet::new();
            for account in &telegram.accounts {
                let token = account.bot_token.trim();
                if token.is_empty() {
                    anyhow::bail!("Telegram account bot_token cannot be empty");
                }
                let account_tag = telegram_account_tag(token);
                if account_tag.is_empty() {
                    anyhow::bail!("Telegram account bot_token has invalid account tag");
                }
                if !account_tags.insert(account_tag.clone()) {
                    anyhow::bail!(
                        "Duplicate Telegram account token/account tag '{}'",
                        account_tag
                    );
                }
            }
        }

        if self.cache.enabled && self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be > 0 when the cache is enabled");
        }

        if self.capture.max_concurrent_jobs == 0 {
            anyhow::bail!("capture.max_concurrent_jobs must be >= 1");
        }
        if self.capture.navigation_timeout_secs == 0 {
            anyhow::bail!("capture.navigation_timeout_secs must be > 0");
        }
        for step in &self.capture.steps {
            if step.name.trim().is_empty() {
                anyhow::bail!("capture.steps contains a step without a name");
            }
            if step.selectors.iter().all(|s| s.trim().is_empty()) {
                anyhow::bail!("capture step '{}' has no selectors", step.name);
            }
        }

        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("fetch.timeout_secs must be > 0");
        }
        if self.fetch.max_chars < 256 {
            anyhow::bail!("fetch.max_chars must be >= 256");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ProviderKind};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn validate_accepts_example_config() {
        let cfg = parse_config(include_str!("../../../config/config.example.toml"));
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.backend.providers[0].kind, ProviderKind::Ollama);
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let cfg = parse_config(
            r#"
[backend]
default_provider = "local"

[[backend.providers]]
name = "local"
"#,
        );
        assert!(cfg.validate().is_ok());
        let provider = cfg.default_provider().expect("default provider");
        assert_eq!(provider.kind, ProviderKind::Ollama);
        assert_eq!(provider.options.num_predict, 1024);
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.capture.max_concurrent_jobs, 2);
    }

    #[test]
    fn validate_rejects_unknown_default_provider() {
        let cfg = parse_config(
            r#"
[backend]
default_provider = "missing"

[[backend.providers]]
name = "local"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_command_provider_without_command() {
        let cfg = parse_config(
            r#"
[[backend.providers]]
name = "cli"
kind = "command"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_provider_kind() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
[[backend.providers]]
name = "x"
kind = "carrier-pigeon"
"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_rejects_duplicate_telegram_account_tags() {
        let cfg = parse_config(
            r#"
[telegram]
[[telegram.accounts]]
bot_token = "123:abc"
[[telegram.accounts]]
bot_token = "123:def"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_capture_concurrency() {
        let cfg = parse_config(
            r#"
[capture]
max_concurrent_jobs = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_capture_step_without_selectors() {
        let cfg = parse_config(
            r#"
[[capture.steps]]
name = "open-item"
selectors = ["  "]
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_cache_ttl_only_when_enabled() {
        let enabled = parse_config(
            r#"
[cache]
ttl_secs = 0
"#,
        );
        assert!(enabled.validate().is_err());

        let disabled = parse_config(
            r#"
[cache]
enabled = false
ttl_secs = 0
"#,
        );
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn token_override_replaces_first_account() {
        let mut cfg = parse_config(
            r#"
[telegram]
[[telegram.accounts]]
bot_token = "111:old"
"#,
        );
        cfg.apply_token_override(Some("222:new".to_string()));
        let accounts = &cfg.telegram.as_ref().expect("telegram").accounts;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].bot_token, "222:new");
        assert_eq!(accounts[0].account_tag(), "222");
    }

    #[test]
    fn token_override_creates_account_when_missing() {
        let mut cfg = Config::default();
        cfg.apply_token_override(Some("  333:tok ".to_string()));
        let accounts = &cfg.telegram.as_ref().expect("telegram").accounts;
        assert_eq!(accounts[0].bot_token, "333:tok");

        let mut untouched = Config::default();
        untouched.apply_token_override(Some("   ".to_string()));
        assert!(untouched.telegram.is_none());
    }

    #[test]
    fn allowed_chats_none_accepts_everyone() {
        let cfg = parse_config(
            r#"
[telegram]
[[telegram.accounts]]
bot_token = "1:a"
[[telegram.accounts]]
bot_token = "2:b"
allowed_chats = [10]
"#,
        );
        let accounts = &cfg.telegram.as_ref().expect("telegram").accounts;
        assert!(accounts[0].is_chat_allowed(42));
        assert!(accounts[1].is_chat_allowed(10));
        assert!(!accounts[1].is_chat_allowed(42));
    }
}
