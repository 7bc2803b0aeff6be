use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::secrets::SecretSource;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub filters: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_imap_server")]
    pub imap_server: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_mailbox_password")]
    pub password: SecretSource,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            imap_server: default_imap_server(),
            imap_port: default_imap_port(),
            folder: default_folder(),
            connect_timeout_secs: default_connect_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            password: default_mailbox_password(),
        }
    }
}

impl MailboxConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// "llm" for the external service, "rules" for the offline rule set
    #[serde(default = "default_classifier_mode")]
    pub mode: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: SecretSource,
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            mode: default_classifier_mode(),
            model: default_model(),
            api_url: default_api_url(),
            api_key: default_api_key(),
            timeout_secs: default_classifier_timeout_secs(),
            max_body_chars: default_max_body_chars(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Lookback window for first runs and `--full` resyncs
    #[serde(default = "default_days_lookback")]
    pub days_lookback: u32,
    #[serde(default = "default_max_messages_per_run")]
    pub max_messages_per_run: usize,
    /// Messages fetched and classified ahead of the router
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Persist the checkpoint every N committed messages
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Give up on a message after it failed in this many runs (0 = never)
    #[serde(default = "default_max_failed_runs")]
    pub max_failed_runs: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            days_lookback: default_days_lookback(),
            max_messages_per_run: default_max_messages_per_run(),
            concurrency: default_concurrency(),
            checkpoint_interval: default_checkpoint_interval(),
            max_failed_runs: default_max_failed_runs(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the knowledge base
    #[serde(default = "default_knowledge_dir")]
    pub knowledge_dir: PathBuf,
    /// Checkpoint and lock file location
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            knowledge_dir: default_knowledge_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl PathsConfig {
    pub fn knowledge_dir(&self) -> PathBuf {
        expand_home(&self.knowledge_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.state_dir)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Process only matching senders
    Allow,
    /// Process everything except matching senders
    #[default]
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Case-insensitive regexes matched against the full From header
    #[serde(default)]
    pub patterns: Vec<String>,
}

fn default_imap_server() -> String {
    "imap.gmail.com".to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_io_timeout_secs() -> u64 {
    60
}

fn default_mailbox_password() -> SecretSource {
    SecretSource::Keychain {
        service: "email-kb".to_string(),
        account: None,
    }
}

fn default_classifier_mode() -> String {
    "llm".to_string()
}

fn default_model() -> String {
    "claude-3-haiku-20240307".to_string()
}

fn default_api_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_api_key() -> SecretSource {
    SecretSource::Keychain {
        service: "anthropic".to_string(),
        account: Some("api_key".to_string()),
    }
}

fn default_classifier_timeout_secs() -> u64 {
    60
}

fn default_max_body_chars() -> usize {
    4000
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_days_lookback() -> u32 {
    7
}

fn default_max_messages_per_run() -> usize {
    200
}

fn default_concurrency() -> usize {
    4
}

fn default_checkpoint_interval() -> usize {
    25
}

fn default_max_failed_runs() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_knowledge_dir() -> PathBuf {
    PathBuf::from("~/personal")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("~/.email-kb")
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SyncError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| SyncError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::ConfigError(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SyncError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| SyncError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.mailbox.imap_server.trim().is_empty() {
            return Err(SyncError::ConfigError(
                "mailbox.imap_server cannot be empty".to_string(),
            ));
        }
        if self.mailbox.imap_port == 0 {
            return Err(SyncError::ConfigError(
                "mailbox.imap_port must be greater than 0".to_string(),
            ));
        }
        if self.mailbox.folder.trim().is_empty() {
            return Err(SyncError::ConfigError(
                "mailbox.folder cannot be empty".to_string(),
            ));
        }
        if self.mailbox.connect_timeout_secs == 0 || self.mailbox.io_timeout_secs == 0 {
            return Err(SyncError::ConfigError(
                "mailbox timeouts must be at least 1 second".to_string(),
            ));
        }
        self.mailbox.password.validate("mailbox.password")?;

        match self.classifier.mode.as_str() {
            "llm" | "rules" => {}
            other => {
                return Err(SyncError::ConfigError(format!(
                    "Invalid classifier.mode: '{}'. Must be 'llm' or 'rules'",
                    other
                )));
            }
        }
        if self.classifier.mode == "llm" {
            if self.classifier.model.trim().is_empty() {
                return Err(SyncError::ConfigError(
                    "classifier.model cannot be empty".to_string(),
                ));
            }
            if !self.classifier.api_url.starts_with("http://")
                && !self.classifier.api_url.starts_with("https://")
            {
                return Err(SyncError::ConfigError(format!(
                    "classifier.api_url must be an http(s) URL, got '{}'",
                    self.classifier.api_url
                )));
            }
            self.classifier.api_key.validate("classifier.api_key")?;
        }
        if self.classifier.timeout_secs == 0 {
            return Err(SyncError::ConfigError(
                "classifier.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.classifier.max_body_chars == 0 {
            return Err(SyncError::ConfigError(
                "classifier.max_body_chars must be greater than 0".to_string(),
            ));
        }

        // Lookback window must be 1-365 days
        if self.sync.days_lookback == 0 {
            return Err(SyncError::ConfigError(
                "sync.days_lookback must be at least 1".to_string(),
            ));
        }
        if self.sync.days_lookback > 365 {
            return Err(SyncError::ConfigError(
                "sync.days_lookback cannot exceed 365 (1 year)".to_string(),
            ));
        }
        if self.sync.max_messages_per_run == 0 {
            return Err(SyncError::ConfigError(
                "sync.max_messages_per_run must be at least 1".to_string(),
            ));
        }
        if self.sync.concurrency == 0 || self.sync.concurrency > 16 {
            return Err(SyncError::ConfigError(
                "sync.concurrency must be between 1 and 16".to_string(),
            ));
        }
        if self.sync.checkpoint_interval == 0 {
            return Err(SyncError::ConfigError(
                "sync.checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.sync.retry.max_attempts == 0 || self.sync.retry.max_attempts > 10 {
            return Err(SyncError::ConfigError(
                "sync.retry.max_attempts must be between 1 and 10".to_string(),
            ));
        }
        if self.sync.retry.max_backoff_ms < self.sync.retry.initial_backoff_ms {
            return Err(SyncError::ConfigError(
                "sync.retry.max_backoff_ms cannot be smaller than initial_backoff_ms".to_string(),
            ));
        }

        if self.paths.knowledge_dir.as_os_str().is_empty() {
            return Err(SyncError::ConfigError(
                "paths.knowledge_dir cannot be empty".to_string(),
            ));
        }
        if self.paths.state_dir.as_os_str().is_empty() {
            return Err(SyncError::ConfigError(
                "paths.state_dir cannot be empty".to_string(),
            ));
        }

        // Compiling the filter validates its patterns
        crate::filters::EmailFilter::from_config(&self.filters)?;

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Commands that talk to the mailbox need an address
    pub fn require_mailbox(&self) -> Result<()> {
        if self.mailbox.address.trim().is_empty() {
            return Err(SyncError::ConfigError(
                "mailbox.address is not configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
