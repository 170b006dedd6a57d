//! Lettermill configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LettermillConfig {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_database() -> String {
    "~/.lettermill/lettermill.db".into()
}

impl Default for LettermillConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            smtp: SmtpConfig::default(),
            sender: SenderConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl LettermillConfig {
    /// Load config from the default path (~/.lettermill/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::LettermillError::Config(format!("Failed to read config: {e}"))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::LettermillError::Config(format!("Failed to parse config: {e}"))
        })?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| {
            crate::error::LettermillError::Config(format!("Failed to serialize config: {e}"))
        })?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lettermill")
            .join("config.toml")
    }

    /// Get the Lettermill home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lettermill")
    }
}

/// SMTP relay configuration for the outbound dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Per-send timeout; expiry counts as a send failure.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_send_timeout() -> u64 {
    30
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

/// Sender address policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Used when a project has no verified sender of its own.
    #[serde(default = "default_fallback_address")]
    pub fallback_address: String,
    /// Base URL for unsubscribe links appended to marketing sends.
    #[serde(default = "default_unsubscribe_base")]
    pub unsubscribe_base_url: String,
}

fn default_fallback_address() -> String {
    "Lettermill <no-reply@mail.lettermill.dev>".into()
}
fn default_unsubscribe_base() -> String {
    "https://mail.lettermill.dev".into()
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            fallback_address: default_fallback_address(),
            unsubscribe_base_url: default_unsubscribe_base(),
        }
    }
}

/// Worker loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Per-task lock lease; an expired lock lets a later tick retry a task
    /// whose worker died mid-send.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: i64,
}

fn default_lock_ttl() -> i64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LettermillConfig::default();
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.scheduler.lock_ttl_secs, 3600);
        assert!(cfg.sender.fallback_address.contains('@'));
    }

    #[test]
    fn test_partial_toml() {
        let cfg: LettermillConfig = toml::from_str(
            "[smtp]\nhost = \"smtp.example.com\"\nusername = \"mailer\"\n",
        )
        .unwrap();
        assert_eq!(cfg.smtp.host, "smtp.example.com");
        // Untouched sections keep their defaults
        assert_eq!(cfg.scheduler.lock_ttl_secs, 3600);
    }
}
