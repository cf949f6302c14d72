// src/config.rs

//! Loads the flat `KEY=VALUE` configuration file used by the queue manager,
//! mirroring the admin tooling's own `freebsd_config` convention rather than
//! a structured format: one key per line, `#`-prefixed comments, blank lines
//! ignored, unknown keys logged and skipped.

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fs;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/qmanager.conf";
const DEFAULT_DATABASE_FILE: &str = "/var/db/qmanager/qmanager.db";
const DEFAULT_SOCKET_PATH: &str = "/tmp/.qmgr";
const DEFAULT_SOCKET_MODE: u32 = 0o666;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_BACKLOG: u32 = 100;

/// The resolved, validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_file: String,
    pub socket_path: String,
    pub socket_mode: u32,
    pub log_level: String,
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            socket_mode: DEFAULT_SOCKET_MODE,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl Config {
    /// Resolves the config file's path — an explicit `--config` flag wins,
    /// then the `QMANAGER_PATH` environment variable, then the compiled-in
    /// default — and loads it. A missing file at the default path is not an
    /// error; an explicitly requested one that is missing is.
    pub fn load(explicit_path: Option<&str>) -> Result<Self> {
        let path = explicit_path
            .map(str::to_string)
            .or_else(|| std::env::var("QMANAGER_PATH").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit_path.is_none() => {
                warn!(path = %path, "no configuration file found, using defaults");
                String::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file '{path}'"));
            }
        };

        let config = Self::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn from_str(contents: &str) -> Result<Self> {
        let mut raw = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(anyhow!("malformed config line {}: '{}'", lineno + 1, line));
            };
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut config = Self::default();
        for (key, value) in raw {
            match key.as_str() {
                "QMANAGER_DATABASE_FILE" => config.database_file = value,
                "QMANAGER_SOCKET" => config.socket_path = value,
                "QMANAGER_SOCKET_MODE" => {
                    config.socket_mode = u32::from_str_radix(value.trim_start_matches("0o"), 8)
                        .or_else(|_| value.parse())
                        .with_context(|| format!("invalid QMANAGER_SOCKET_MODE '{value}'"))?;
                }
                "QMANAGER_LOG_LEVEL" => config.log_level = value,
                "QMANAGER_BACKLOG" => {
                    config.backlog = value
                        .parse()
                        .with_context(|| format!("invalid QMANAGER_BACKLOG '{value}'"))?;
                }
                "QMANAGER_PATH" => {
                    // Only meaningful as an environment variable selecting which
                    // file to read; harmless (and ignored) if also set inside it.
                }
                other => warn!(key = other, "ignoring unknown configuration key"),
            }
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.socket_path.trim().is_empty() {
            return Err(anyhow!("QMANAGER_SOCKET cannot be empty"));
        }
        if self.database_file.trim().is_empty() {
            return Err(anyhow!("QMANAGER_DATABASE_FILE cannot be empty"));
        }
        if self.backlog == 0 {
            return Err(anyhow!("QMANAGER_BACKLOG cannot be 0"));
        }
        if self.socket_mode > 0o777 {
            return Err(anyhow!("QMANAGER_SOCKET_MODE must be a valid permission bitmask"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
    }

    #[test]
    fn parses_known_keys_and_ignores_comments() {
        let contents = "\
# a comment
QMANAGER_SOCKET=/tmp/.qmgr
QMANAGER_SOCKET_MODE=0640
QMANAGER_BACKLOG=50
QMANAGER_LOG_LEVEL=debug
";
        let config = Config::from_str(contents).unwrap();
        assert_eq!(config.socket_path, "/tmp/.qmgr");
        assert_eq!(config.socket_mode, 0o640);
        assert_eq!(config.backlog, 50);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Config::from_str("NOT_A_KEY_VALUE_LINE").is_err());
    }

    #[test]
    fn rejects_zero_backlog() {
        let config = Config::from_str("QMANAGER_BACKLOG=0").unwrap();
        assert!(config.validate().is_err());
    }
}
