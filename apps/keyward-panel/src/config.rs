use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;

use crate::services::key_service::KeyFormat;
use crate::services::rate_limit_service::{RateLimit, RateLimitConfig};

const CONFIG_PATHS: [&str; 2] = ["/etc/keyward/panel.toml", "./panel.toml"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub listen_port: u16,
    pub database_url: String,
    /// Bearer token for `/api/admin`. Admin routes are disabled without it.
    pub admin_token: Option<String>,
    pub log_dir: String,
    pub log_retention_days: i64,
    pub key_format: KeyFormat,
    pub rate_limit: RateLimitConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            database_url: "sqlite:keyward.db".to_string(),
            admin_token: None,
            log_dir: ".".to_string(),
            log_retention_days: 90,
            key_format: KeyFormat::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl PanelConfig {
    /// Returns the config and where it came from. Runs before logging is
    /// set up, so the caller reports the source.
    pub fn load() -> Result<(Self, &'static str)> {
        Self::load_from(&CONFIG_PATHS)
    }

    fn load_from<'a>(paths: &[&'a str]) -> Result<(Self, &'a str)> {
        for path in paths {
            if let Ok(contents) = fs::read_to_string(path) {
                let config: Self =
                    toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
                config.validate()?;
                return Ok((config, path));
            }
        }

        let config = Self::from_env()?;
        config.validate()?;
        Ok((config, "environment"))
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let limits = &defaults.rate_limit;

        Ok(Self {
            listen_port: env_or("LISTEN_PORT", defaults.listen_port)?,
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            log_dir: std::env::var("LOG_DIR").unwrap_or(defaults.log_dir),
            log_retention_days: env_or("LOG_RETENTION_DAYS", defaults.log_retention_days)?,
            key_format: KeyFormat {
                prefix: std::env::var("LICENSE_PREFIX").unwrap_or(defaults.key_format.prefix),
                length: env_or("LICENSE_LENGTH", defaults.key_format.length)?,
                charset: std::env::var("LICENSE_CHARSET").unwrap_or(defaults.key_format.charset),
            },
            rate_limit: RateLimitConfig {
                verify: limit_from_env("VERIFY", limits.verify)?,
                login: limit_from_env("LOGIN", limits.login)?,
                api: limit_from_env("API", limits.api)?,
                default: limit_from_env("DEFAULT", limits.default)?,
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            bail!("DATABASE_URL must be a sqlite: URL, got '{}'", self.database_url);
        }
        if self.log_retention_days < 1 {
            bail!("log_retention_days must be at least 1");
        }
        self.key_format.validate()?;
        Ok(())
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_token.is_some()
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn limit_from_env(class: &str, default: RateLimit) -> Result<RateLimit> {
    Ok(RateLimit::new(
        env_or(&format!("RATE_LIMIT_{}_MAX", class), default.max_requests)?,
        env_or(&format!("RATE_LIMIT_{}_PER", class), default.window_secs)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PanelConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.admin_enabled());
        assert_eq!(config.rate_limit.verify, RateLimit::new(10, 60));
        assert_eq!(config.key_format.length, 18);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: PanelConfig = toml::from_str(
            r#"
            listen_port = 9000
            admin_token = "s3cret"

            [key_format]
            prefix = "kw"

            [rate_limit.verify]
            max_requests = 3
            window_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_port, 9000);
        assert!(config.admin_enabled());
        assert_eq!(config.key_format.prefix, "kw");
        assert_eq!(config.key_format.length, 18);
        assert_eq!(config.rate_limit.verify, RateLimit::new(3, 30));
        assert_eq!(config.rate_limit.login, RateLimit::new(5, 60));
        assert_eq!(config.database_url, "sqlite:keyward.db");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let postgres = PanelConfig {
            database_url: "postgres://localhost/keyward".to_string(),
            ..PanelConfig::default()
        };
        assert!(postgres.validate().is_err());

        let cramped = PanelConfig {
            key_format: KeyFormat {
                prefix: "abcdef".to_string(),
                length: 6,
                ..KeyFormat::default()
            },
            ..PanelConfig::default()
        };
        assert!(cramped.validate().is_err());
    }

    #[test]
    fn test_first_existing_file_wins_and_is_reported() {
        let path = std::env::temp_dir().join(format!("keyward-panel-{}.toml", std::process::id()));
        fs::write(&path, "listen_port = 9123\n").unwrap();
        let path_str = path.to_str().unwrap();

        let (config, source) =
            PanelConfig::load_from(&["/nonexistent/keyward/panel.toml", path_str]).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(source, path_str);
        assert_eq!(config.listen_port, 9123);
    }
}
