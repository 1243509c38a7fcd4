//! Notiflow configuration system.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NotiflowError, Result};

/// Shortest window the execution guard may use. A key must outlive the tick it was set in.
pub const MIN_GUARD_WINDOW_SECS: u64 = 60;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotiflowConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl NotiflowConfig {
    /// Load config from the default path (~/.notiflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific path. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NotiflowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| NotiflowError::Config(format!("Failed to parse config: {e}")))?;
        config.scheduler.offset()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NotiflowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Notiflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".notiflow")
    }

    /// Apply `EMAIL_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.smtp.apply_env_with(|key| std::env::var(key).ok());
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tenant offset such as "+05:30". `None` uses the host's local offset.
    #[serde(default)]
    pub utc_offset: Option<String>,
    #[serde(default = "default_guard_window_secs")]
    pub guard_window_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_guard_window_secs() -> u64 { 120 }
fn default_max_concurrent() -> usize { 8 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            utc_offset: None,
            guard_window_secs: default_guard_window_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl SchedulerConfig {
    /// Guard expiry window, never shorter than one minute.
    pub fn guard_window(&self) -> Duration {
        Duration::from_secs(self.guard_window_secs.max(MIN_GUARD_WINDOW_SECS))
    }

    /// Parsed tenant offset, if one is configured.
    pub fn offset(&self) -> Result<Option<FixedOffset>> {
        self.utc_offset.as_deref().map(parse_utc_offset).transpose()
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

/// Parse "+HH:MM", "-HH:MM", "+HHMM" or "Z" into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| NotiflowError::Config(format!("Invalid utc_offset: {raw}")));
    }
    let invalid = || NotiflowError::Config(format!("Invalid utc_offset: {raw}"));
    let (sign, rest) = match s.chars().next() {
        Some('+') => (1, &s[1..]),
        Some('-') => (-1, &s[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Outbound webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// System-wide webhook applied to tasks that have none.
    #[serde(default = "default_webhook_url")]
    pub default_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_webhook_url() -> String { "http://localhost:5678/webhook/execute-task".into() }
fn default_timeout_secs() -> u64 { 15 }
fn default_user_agent() -> String { format!("notiflow-scheduler/{}", env!("CARGO_PKG_VERSION")) }

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_url: default_webhook_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// SMTP transport configuration for direct-email delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Envelope sender when a task does not name one.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default = "bool_true")]
    pub starttls: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 { 587 }
fn bool_true() -> bool { true }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_smtp_port(),
            username: None,
            password: None,
            from: None,
            starttls: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SmtpConfig {
    /// Host, username and password are all present and non-empty.
    pub fn is_configured(&self) -> bool {
        [&self.host, &self.username, &self.password]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("EMAIL_HOST") {
            self.host = Some(host);
        }
        if let Some(port) = lookup("EMAIL_PORT") {
            match port.trim().parse() {
                Ok(p) => self.port = p,
                Err(_) => tracing::warn!("⚠️ Ignoring invalid EMAIL_PORT: {port}"),
            }
        }
        if let Some(user) = lookup("EMAIL_USER") {
            self.username = Some(user);
        }
        if let Some(pass) = lookup("EMAIL_PASS") {
            self.password = Some(pass);
        }
        if let Some(from) = lookup("EMAIL_FROM") {
            self.from = Some(from);
        }
        // EMAIL_SECURE=true means implicit TLS (port 465), so no STARTTLS upgrade.
        if let Some(secure) = lookup("EMAIL_SECURE") {
            self.starttls = secure.trim() != "true";
        }
    }
}

/// Task store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.notiflow/tasks.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = NotiflowConfig::default();
        assert_eq!(config.scheduler.guard_window(), Duration::from_secs(120));
        assert_eq!(config.webhook.timeout_secs, 15);
        assert_eq!(config.smtp.port, 587);
        assert!(!config.smtp.is_configured());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NotiflowConfig = toml::from_str(
            r#"
            [scheduler]
            utc_offset = "+05:30"

            [webhook]
            default_url = "https://hooks.example.com/run"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.guard_window_secs, 120);
        assert_eq!(config.webhook.default_url, "https://hooks.example.com/run");
        assert_eq!(config.webhook.timeout_secs, 15);
        let offset = config.scheduler.offset().unwrap().unwrap();
        assert_eq!(offset.local_minus_utc(), 5 * 3600 + 30 * 60);
    }

    #[test]
    fn test_guard_window_is_clamped() {
        let config = SchedulerConfig { guard_window_secs: 5, ..Default::default() };
        assert_eq!(config.guard_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("-0800").unwrap().local_minus_utc(), -8 * 3600);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("05:30").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("EMAIL_HOST", "smtp.example.com"),
            ("EMAIL_PORT", "465"),
            ("EMAIL_USER", "bot@example.com"),
            ("EMAIL_PASS", "secret"),
            ("EMAIL_SECURE", "true"),
        ]
        .into_iter()
        .collect();
        let mut smtp = SmtpConfig::default();
        smtp.apply_env_with(|k| env.get(k).map(|v| v.to_string()));
        assert!(smtp.is_configured());
        assert_eq!(smtp.port, 465);
        assert!(!smtp.starttls);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = NotiflowConfig::default();
        config.scheduler.max_concurrent = 3;
        config.save_to(&path).unwrap();
        let loaded = NotiflowConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.max_concurrent, 3);
    }
}
