//! Runtime settings derived from `MAGG_*` environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{validate_prefix, DEFAULT_PREFIX_SEP};

/// Default self-prefix for the aggregator's own admin tools.
pub const DEFAULT_SELF_PREFIX: &str = "magg";

/// Default catalog location relative to the working directory.
pub const DEFAULT_CONFIG_RELATIVE: &str = ".magg/config.json";

/// Whether to use file-system notifications for config watching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Always use the watcher; fail loudly if it cannot start.
    On,
    /// Never use the watcher; poll mtimes only.
    Off,
    /// Try the watcher, fall back to polling.
    #[default]
    Auto,
}

/// Settings validation error.
#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process-wide settings. Everything here is fixed for the lifetime of the
/// process; the catalog is the only thing that reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Catalog file path.
    pub config_path: PathBuf,

    /// Enable the config watcher.
    pub auto_reload: bool,

    /// Poll interval in seconds for the mtime fallback.
    pub reload_poll_interval: f64,

    /// File-system notification mode.
    pub reload_use_watchdog: WatchMode,

    /// Refuse catalog saves (in-memory reloads still work).
    pub read_only: bool,

    /// Prefix for the aggregator's own admin tools.
    pub self_prefix: String,

    /// Separator between prefix and local capability name.
    pub prefix_sep: String,

    /// Forward subprocess stderr to our stderr instead of discarding it.
    pub stderr_show: bool,

    /// PEM private key material, overriding the key file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Client-side bearer token for talking to a protected aggregator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,

    /// Log-notification rate limit per backend: `burst/per_second`.
    pub log_rate: (u32, u32),
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_RELATIVE),
            auto_reload: true,
            reload_poll_interval: 1.0,
            reload_use_watchdog: WatchMode::Auto,
            read_only: false,
            self_prefix: DEFAULT_SELF_PREFIX.to_string(),
            prefix_sep: DEFAULT_PREFIX_SEP.to_string(),
            stderr_show: false,
            private_key: None,
            jwt: None,
            log_rate: (20, 10),
        }
    }
}

impl Settings {
    /// Build settings from `MAGG_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(path) = env_var("MAGG_CONFIG_PATH") {
            settings.config_path = PathBuf::from(path);
        }
        if let Some(v) = env_var("MAGG_AUTO_RELOAD") {
            settings.auto_reload = parse_bool(&v).unwrap_or(settings.auto_reload);
        }
        if let Some(v) = env_var("MAGG_RELOAD_POLL_INTERVAL") {
            if let Ok(secs) = v.parse::<f64>() {
                settings.reload_poll_interval = secs;
            }
        }
        if let Some(v) = env_var("MAGG_RELOAD_USE_WATCHDOG") {
            settings.reload_use_watchdog = match v.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => WatchMode::On,
                "off" | "false" | "0" => WatchMode::Off,
                _ => WatchMode::Auto,
            };
        }
        if let Some(v) = env_var("MAGG_READ_ONLY") {
            settings.read_only = parse_bool(&v).unwrap_or(settings.read_only);
        }
        if let Some(v) = env_var("MAGG_SELF_PREFIX") {
            settings.self_prefix = v;
        }
        if let Some(v) = env_var("MAGG_PREFIX_SEP") {
            settings.prefix_sep = v;
        }
        if let Some(v) = env_var("MAGG_STDERR_SHOW") {
            settings.stderr_show = parse_bool(&v).unwrap_or(settings.stderr_show);
        }
        settings.private_key = env_var("MAGG_PRIVATE_KEY");
        settings.jwt = env_var("MAGG_JWT");

        if let Some(v) = env_var("MAGG_LOG_RATE") {
            if let Some((burst, rate)) = v.split_once('/') {
                if let (Ok(b), Ok(r)) = (burst.parse(), rate.parse()) {
                    settings.log_rate = (b, r);
                }
            }
        }

        settings
    }

    /// Validate fields whose bad values would corrupt the aggregated
    /// namespace rather than just misbehave.
    pub fn validate(&self) -> Result<(), SettingsError> {
        validate_prefix(&self.self_prefix, &self.prefix_sep).map_err(|reason| {
            SettingsError::Invalid {
                name: "self_prefix",
                reason,
            }
        })?;

        if self.prefix_sep.is_empty() {
            return Err(SettingsError::Invalid {
                name: "prefix_sep",
                reason: "separator must not be empty".into(),
            });
        }
        if self.prefix_sep.chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(SettingsError::Invalid {
                name: "prefix_sep",
                reason: "separator must not be alphanumeric".into(),
            });
        }

        if !self.reload_poll_interval.is_finite() || self.reload_poll_interval <= 0.0 {
            return Err(SettingsError::Invalid {
                name: "reload_poll_interval",
                reason: format!("must be a positive number, got {}", self.reload_poll_interval),
            });
        }

        Ok(())
    }

    /// Directory the catalog file lives in; kits are discovered in its
    /// `kit.d` subdirectory.
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
    }

    /// Kit discovery directory.
    #[must_use]
    pub fn kitd_path(&self) -> PathBuf {
        self.config_dir().join("kit.d")
    }

    /// Directory holding the RSA keypair for bearer auth.
    #[must_use]
    pub fn key_dir(&self) -> PathBuf {
        self.config_dir().join("keys")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.self_prefix, "magg");
        assert_eq!(settings.prefix_sep, "_");
        assert!(settings.auto_reload);
        assert!(!settings.read_only);
    }

    #[test]
    fn separator_must_not_be_alphanumeric() {
        let settings = Settings {
            prefix_sep: "x".into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn self_prefix_must_not_contain_separator() {
        let settings = Settings {
            self_prefix: "my_agg".into(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn poll_interval_must_be_positive() {
        let settings = Settings {
            reload_poll_interval: 0.0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn kitd_sits_next_to_config() {
        let settings = Settings {
            config_path: PathBuf::from("/etc/magg/config.json"),
            ..Settings::default()
        };
        assert_eq!(settings.kitd_path(), PathBuf::from("/etc/magg/kit.d"));
    }
}
