//! Configuration management module
//!
//! Handles loading, validation, and management of client configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::protocol::TerminalPolicy;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Job server connection
    pub server: ServerConfig,

    /// Session channel behaviour
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Websocket base URL of the job server
    pub url: String,

    /// Path of the job socket endpoint
    pub job_path: String,

    /// Timeout for a single connect attempt in seconds
    pub connect_timeout_seconds: u64,

    /// Connect attempts before the channel is closed
    pub max_connect_attempts: u32,

    /// Initial delay between connect attempts in milliseconds
    pub connect_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Drop pending requests older than this; 0 keeps them forever
    pub request_timeout_ms: u64,

    /// How often the pending table is swept for expired requests
    pub sweep_interval_ms: u64,

    /// How terminal response frames are recognised
    pub terminal_policy: TerminalPolicy,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Optional log file; stderr only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log: LogConfig::default(),
            server: ServerConfig::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888".to_string(),
            job_path: "/job".to_string(),
            connect_timeout_seconds: 10,
            max_connect_attempts: 5,
            connect_backoff_ms: 500,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 0,
            sweep_interval_ms: 1000,
            terminal_policy: TerminalPolicy::ProgressFlag,
        }
    }
}

impl ServerConfig {
    /// Full websocket URL of the job endpoint
    pub fn job_url(&self) -> String {
        let path = self.job_path.trim_start_matches('/');
        if path.is_empty() {
            return self.url.clone();
        }
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }
}

impl SessionSettings {
    /// Request timeout, if enabled
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        // TOYZ_LOG_LEVEL - logging level
        if let Ok(log_level) = env::var("TOYZ_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // TOYZ_LOG_FILE_PATH - logging destination file
        if let Ok(file_path) = env::var("TOYZ_LOG_FILE_PATH") {
            self.log.file_path = (!file_path.trim().is_empty()).then_some(file_path);
        }

        // TOYZ_SERVER_URL - websocket base URL
        if let Ok(url) = env::var("TOYZ_SERVER_URL") {
            self.server.url = url;
        }

        // TOYZ_SERVER_JOB_PATH - job socket path
        if let Ok(job_path) = env::var("TOYZ_SERVER_JOB_PATH") {
            self.server.job_path = job_path;
        }

        // TOYZ_SERVER_CONNECT_TIMEOUT_SECONDS - per-attempt connect timeout
        if let Ok(timeout) = env::var("TOYZ_SERVER_CONNECT_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.server.connect_timeout_seconds = value;
            }
        }

        // TOYZ_SERVER_MAX_CONNECT_ATTEMPTS - connect attempts
        if let Ok(attempts) = env::var("TOYZ_SERVER_MAX_CONNECT_ATTEMPTS") {
            if let Ok(value) = attempts.parse::<u32>() {
                self.server.max_connect_attempts = value;
            }
        }

        // TOYZ_SESSION_REQUEST_TIMEOUT_MS - pending request timeout
        if let Ok(timeout) = env::var("TOYZ_SESSION_REQUEST_TIMEOUT_MS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.session.request_timeout_ms = value;
            }
        }

        // TOYZ_SESSION_TERMINAL_POLICY - progress_flag | explicit_finish
        if let Ok(policy) = env::var("TOYZ_SESSION_TERMINAL_POLICY") {
            match policy.parse::<TerminalPolicy>() {
                Ok(value) => self.session.terminal_policy = value,
                Err(e) => tracing::warn!("Ignoring TOYZ_SESSION_TERMINAL_POLICY: {}", e),
            }
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {}, using defaults", err);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            anyhow::bail!("Unknown log level: {}", self.log_level);
        }

        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            anyhow::bail!("Server URL must use ws:// or wss://: {}", self.server.url);
        }

        if self.server.connect_timeout_seconds == 0 {
            anyhow::bail!("Connect timeout must be greater than 0");
        }

        if self.server.max_connect_attempts == 0 {
            anyhow::bail!("At least one connect attempt is required");
        }

        if self.session.request_timeout_ms > 0 && self.session.sweep_interval_ms == 0 {
            anyhow::bail!(
                "session.sweep_interval_ms must be greater than 0 when a request timeout is set"
            );
        }

        if let Some(path) = &self.log.file_path {
            if path.trim().is_empty() {
                anyhow::bail!("Log file path must not be empty");
            }
        }

        Ok(())
    }

    /// Display formatted configuration
    pub fn display(&self) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        println!("Current configuration:");
        println!("{}", content);
        println!("Job socket URL: {}", self.server.job_url());
        Ok(())
    }

    /// Handle configuration command
    pub fn handle_command(action: &Option<crate::cli::ConfigAction>, path: &str) -> Result<()> {
        match action {
            Some(crate::cli::ConfigAction::Show) | None => {
                let config = Config::load_or_default(path);
                config.display()?;
            }
            Some(crate::cli::ConfigAction::Reset) => {
                let default_config = Config::default();
                default_config.save_to_file(path)?;
                println!("Configuration reset: {}", path);
                default_config.display()?;
            }
        }
        Ok(())
    }
}
