//! Configuration file support

use concierge_agent::{BatchConfig, MismatchPolicy, OrchestratorConfig, RetryConfig};
use concierge_core::UserContext;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for concierge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a clarification question stays answerable, in seconds
    pub interrupt_timeout_secs: i64,
    /// How many recent messages are kept per thread
    pub recent_messages_limit: usize,
    /// What to do when a reply answers a different question (reprompt, abandon)
    pub mismatch_policy: MismatchPolicy,
    /// Items processed at once in batch mode
    pub batch_concurrency: usize,
    /// Retries for transient failures in batch mode
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    /// User profile
    #[serde(default)]
    pub user: UserSettings,
}

/// User profile settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub name: Option<String>,
    pub locale: String,
    pub timezone: String,
    /// Offset from UTC applied to local times
    pub utc_offset_minutes: i32,
    /// Capability tags the user enabled; empty enables everything
    pub enabled_capabilities: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interrupt_timeout_secs: concierge_agent::hitl::DEFAULT_INTERRUPT_TIMEOUT_SECS,
            recent_messages_limit: concierge_agent::reducer::DEFAULT_RECENT_MESSAGES_LIMIT,
            mismatch_policy: MismatchPolicy::default(),
            batch_concurrency: concierge_agent::batch::DEFAULT_BATCH_CONCURRENCY,
            max_retries: 2,
            retry_initial_delay_ms: 1000,
            retry_backoff_multiplier: 2.0,
            user: UserSettings::default(),
        }
    }
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            name: None,
            locale: "en".to_string(),
            timezone: "UTC".to_string(),
            utc_offset_minutes: 0,
            enabled_capabilities: Vec::new(),
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("concierge")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for CONCIERGE_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("CONCIERGE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => config.validated(),
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Replace values the runtime cannot use with their defaults
    fn validated(mut self) -> Self {
        let defaults = Self::default();
        let timeout_ok = self.interrupt_timeout_secs > 0
            && chrono::Duration::try_seconds(self.interrupt_timeout_secs).is_some();
        if !timeout_ok {
            eprintln!(
                "Warning: interrupt_timeout_secs = {} is out of range, using {}",
                self.interrupt_timeout_secs, defaults.interrupt_timeout_secs
            );
            self.interrupt_timeout_secs = defaults.interrupt_timeout_secs;
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 0.0 {
            eprintln!(
                "Warning: retry_backoff_multiplier = {} must be a non-negative number, using {}",
                self.retry_backoff_multiplier, defaults.retry_backoff_multiplier
            );
            self.retry_backoff_multiplier = defaults.retry_backoff_multiplier;
        }
        self
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Orchestrator settings derived from this config
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            interrupt_timeout: chrono::Duration::try_seconds(self.interrupt_timeout_secs.max(1))
                .unwrap_or_else(concierge_agent::hitl::default_interrupt_timeout),
            recent_messages_limit: self.recent_messages_limit.max(1),
            mismatch_policy: self.mismatch_policy,
        }
    }

    /// Batch settings derived from this config
    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            concurrency: self.batch_concurrency.max(1),
            retry: RetryConfig {
                max_retries: self.max_retries,
                initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
                backoff_multiplier: self.retry_backoff_multiplier,
                ..RetryConfig::default()
            },
        }
    }

    /// The user profile sent with every turn
    pub fn user_context(&self) -> UserContext {
        let defaults = UserContext::default();
        UserContext {
            display_name: self.user.name.clone(),
            locale: self.user.locale.clone(),
            timezone: self.user.timezone.clone(),
            utc_offset_minutes: self.user.utc_offset_minutes,
            enabled_capabilities: self.user.enabled_capabilities.clone(),
            ..defaults
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# concierge configuration file
# Place at ~/.config/concierge/config.toml (Linux) or set CONCIERGE_CONFIG_PATH

# Seconds a clarification question stays answerable
interrupt_timeout_secs = 300

# Messages kept in each thread's short-term memory
recent_messages_limit = 10

# Reply that answers a different question than the pending one:
# "reprompt" asks the pending question again, "abandon" starts a new turn
mismatch_policy = "reprompt"

# Batch mode (--batch)
batch_concurrency = 5
max_retries = 2
retry_initial_delay_ms = 1000
retry_backoff_multiplier = 2.0

[user]
# name = "Ana"
locale = "en"
timezone = "UTC"
utc_offset_minutes = 0
# Capability tags to enable (calendar, database, mail, memory); empty enables all
enabled_capabilities = []
"#
}
