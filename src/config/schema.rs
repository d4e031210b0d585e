use crate::error::ConfigError;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// `tracing` max level: error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub discord: DiscordConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_log_level() -> String {
    "info".into()
}

// ── Discord ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Gateway intents bitmask. Defaults to GUILDS | GUILD_MESSAGES.
    #[serde(default)]
    pub intents: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub activity_type: Option<u8>,
    #[serde(default)]
    pub activity_name: Option<String>,
    /// REST base URL override, e.g. for a proxy.
    #[serde(default)]
    pub api_base: Option<String>,
}

// ── Retention engine ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Most messages fetched in one enforcement pass
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// How long policy lookups (hits and misses) are cached
    #[serde(default = "default_policy_cache_ttl_secs")]
    pub policy_cache_ttl_secs: u64,
}

fn default_history_window() -> usize {
    5_000
}

fn default_policy_cache_ttl_secs() -> u64 {
    60
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            policy_cache_ttl_secs: default_policy_cache_ttl_secs(),
        }
    }
}

// ── Rate limits ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub fetch: RateLimitConfig,
    #[serde(default)]
    pub delete: RateLimitConfig,
}

/// Spacing and backoff for one class of platform operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,
    #[serde(default = "default_retry_buffer_secs")]
    pub retry_buffer_secs: f64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_max_backoff_secs() -> f64 {
    60.0
}

fn default_retry_buffer_secs() -> f64 {
    1.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            growth_factor: default_growth_factor(),
            max_backoff_secs: default_max_backoff_secs(),
            retry_buffer_secs: default_retry_buffer_secs(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self, label: &str) -> std::result::Result<(), ConfigError> {
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(ConfigError::Validation(format!(
                "rate_limits.{label}.growth_factor must be >= 1.0 (got {})",
                self.growth_factor
            )));
        }
        if !self.max_backoff_secs.is_finite() || self.max_backoff_secs < 0.0 {
            return Err(ConfigError::Validation(format!(
                "rate_limits.{label}.max_backoff_secs must be a non-negative number"
            )));
        }
        if !self.retry_buffer_secs.is_finite() || self.retry_buffer_secs < 0.0 {
            return Err(ConfigError::Validation(format!(
                "rate_limits.{label}.retry_buffer_secs must be a non-negative number"
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        let base_secs = self.base_delay_ms as f64 / 1_000.0;
        if base_secs > self.max_backoff_secs {
            return Err(ConfigError::Validation(format!(
                "rate_limits.{label}: base_delay_ms ({}) exceeds max_backoff_secs ({})",
                self.base_delay_ms, self.max_backoff_secs
            )));
        }
        Ok(())
    }
}

// ── Store ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file; `~` is expanded. Defaults to `servermaid.db` next to
    /// the config file.
    #[serde(default)]
    pub path: Option<String>,
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());

        Self {
            config_path: home.join(".servermaid").join("config.toml"),
            log_level: default_log_level(),
            discord: DiscordConfig::default(),
            retention: RetentionConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Default location: `~/.servermaid/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Ok(home.join(".servermaid").join("config.toml"))
    }

    /// Load the config at `path` (or the default location), writing a
    /// default file first if none exists. Env overrides are applied and the
    /// result validated.
    pub fn load_or_init(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref()),
            None => Self::default_path()?,
        };

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            if let Some(dir) = config_path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir).context("Failed to create config directory")?;
            }
            let config = Self {
                config_path: config_path.clone(),
                ..Self::default()
            };
            config.save()?;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(ConfigError::Io)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::Load(e.to_string()))
            .context("Failed to parse config file")?;
        config.config_path = config_path.to_path_buf();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Bot token: DISCORD_TOKEN or SERVERMAID_DISCORD_TOKEN
        if let Ok(token) =
            std::env::var("DISCORD_TOKEN").or_else(|_| std::env::var("SERVERMAID_DISCORD_TOKEN"))
            && !token.is_empty()
        {
            self.discord.bot_token = token;
        }

        if let Ok(path) = std::env::var("SERVERMAID_DB_PATH")
            && !path.is_empty()
        {
            self.store.path = Some(path);
        }

        if let Ok(level) = std::env::var("SERVERMAID_LOG_LEVEL")
            && !level.is_empty()
        {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.retention.history_window == 0 {
            return Err(ConfigError::Validation(
                "retention.history_window must be greater than 0".into(),
            ));
        }
        self.rate_limits.fetch.validate("fetch")?;
        self.rate_limits.delete.validate("delete")?;
        if parse_level(&self.log_level).is_none() {
            return Err(ConfigError::Validation(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Resolved SQLite path for the policy store.
    pub fn db_path(&self) -> PathBuf {
        match self.store.path.as_deref() {
            Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
            None => self
                .config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("servermaid.db"),
        }
    }

    pub fn tracing_level(&self) -> tracing::Level {
        parse_level(&self.log_level).unwrap_or(tracing::Level::INFO)
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }
}

fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
