// config-rs/src/dispatch.rs
// TOML configuration for the dispatch engine, with environment overrides

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{env_var, parse_bool};

pub const DEFAULT_CONFIG_PATH: &str = "./config/dispatch.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Short device identifier: the first 8 characters of a v4 UUID.
pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub device: DeviceConfig,
    pub session: SessionSettings,
    pub executor: ExecutorSettings,
    pub llm: LlmSettings,
    pub remote: RemoteSettings,
    pub history: HistorySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: generate_device_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    pub safety_mode: bool,
    pub timeout_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            safety_mode: true,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// One of `sh`, `bash`, `powershell`, `cmd`.
    pub shell: String,
    pub poll_interval_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            shell: if cfg!(windows) { "powershell" } else { "sh" }.to_string(),
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_url: String,
    pub model: String,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Only ever read from `LLM_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_retries: 3,
            initial_retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            request_timeout_secs: 60,
            temperature: 0.1,
            max_tokens: 4096,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub enabled: bool,
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub commands_path: String,
    pub results_path: String,
    pub devices_path: String,
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            database_url: None,
            auth_token: None,
            commands_path: "commands".to_string(),
            results_path: "results".to_string(),
            devices_path: "devices".to_string(),
            poll_interval_ms: 1000,
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistorySettings {
    pub ledger_path: PathBuf,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("data/history/ledger.bin"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for a daily rolling log file; console only when unset.
    pub directory: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: false,
        }
    }
}

impl DispatchConfig {
    /// Load configuration the way the binary does: `.env`, then the TOML file
    /// named by `DISPATCH_CONFIG_PATH` (missing file means defaults), then
    /// environment overrides, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_path(None)
    }

    /// Like [`DispatchConfig::load`], but an explicit `path` wins over
    /// `DISPATCH_CONFIG_PATH`.
    pub fn load_with_path(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(
                env_var("DISPATCH_CONFIG_PATH").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
            ),
        };
        Self::load_from(&path)
    }

    /// Load from an explicit path, applying process environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_overrides(env_var);
        config.validate()?;
        Ok(config)
    }

    /// Read only the file layer. A missing file yields defaults.
    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply environment overrides through `lookup`, which returns the value
    /// of a variable when it is set.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = lookup("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(id) = lookup("DEVICE_ID") {
            self.device.id = id;
        }
        if let Some(raw) = lookup("DISPATCH_SAFETY_MODE") {
            match parse_bool(&raw) {
                Some(flag) => self.session.safety_mode = flag,
                None => log::warn!("Invalid DISPATCH_SAFETY_MODE {:?}, ignoring", raw),
            }
        }
        if let Some(raw) = lookup("DISPATCH_TIMEOUT_SECONDS") {
            match raw.trim().parse() {
                Ok(secs) => self.session.timeout_seconds = secs,
                Err(_) => log::warn!("Invalid DISPATCH_TIMEOUT_SECONDS {:?}, ignoring", raw),
            }
        }
        if let Some(url) = lookup("REMOTE_DATABASE_URL") {
            self.remote.database_url = Some(url);
        }
        if let Some(token) = lookup("REMOTE_AUTH_TOKEN") {
            self.remote.auth_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.trim().is_empty() {
            return Err(ConfigError::InvalidValue("device.id must not be empty".into()));
        }
        if self.session.timeout_seconds < 1 {
            return Err(ConfigError::InvalidValue(
                "session.timeout_seconds must be at least 1".into(),
            ));
        }
        if self.executor.poll_interval_ms < 1 {
            return Err(ConfigError::InvalidValue(
                "executor.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.remote.poll_interval_ms < 1 {
            return Err(ConfigError::InvalidValue(
                "remote.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.remote.max_concurrent < 1 {
            return Err(ConfigError::InvalidValue(
                "remote.max_concurrent must be at least 1".into(),
            ));
        }
        if self.remote.enabled
            && self
                .remote
                .database_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(ConfigError::InvalidValue(
                "remote.enabled requires remote.database_url".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert!(config.session.safety_mode);
        assert_eq!(config.session.timeout_seconds, 60);
        assert_eq!(config.executor.poll_interval_ms, 100);
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.remote.max_concurrent, 4);
        assert_eq!(config.remote.commands_path, "commands");
        assert_eq!(config.device.id.len(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = DispatchConfig::from_toml_str(
            r#"
            [session]
            timeout_seconds = 15

            [remote]
            enabled = true
            database_url = "https://example-db.local"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.timeout_seconds, 15);
        assert!(config.session.safety_mode);
        assert_eq!(config.remote.results_path, "results");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DispatchConfig::read_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.session.timeout_seconds, 60);
    }

    #[test]
    fn test_file_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[device]\nid = \"bench-01\"\n[executor]\nshell = \"bash\"").unwrap();
        let config = DispatchConfig::read_file(file.path()).unwrap();
        assert_eq!(config.device.id, "bench-01");
        assert_eq!(config.executor.shell, "bash");
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let err = DispatchConfig::from_toml_str("[session\ntimeout_seconds = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = DispatchConfig::default();
        config.apply_overrides(lookup(&[
            ("DEVICE_ID", "abc12345"),
            ("DISPATCH_SAFETY_MODE", "off"),
            ("DISPATCH_TIMEOUT_SECONDS", "5"),
            ("LLM_MODEL", "local-model"),
            ("LLM_API_KEY", "secret"),
            ("REMOTE_DATABASE_URL", "https://db.local"),
        ]));
        assert_eq!(config.device.id, "abc12345");
        assert!(!config.session.safety_mode);
        assert_eq!(config.session.timeout_seconds, 5);
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.api_key.as_deref(), Some("secret"));
        assert_eq!(config.remote.database_url.as_deref(), Some("https://db.local"));
    }

    #[test]
    fn test_invalid_overrides_are_ignored() {
        let mut config = DispatchConfig::default();
        config.apply_overrides(lookup(&[
            ("DISPATCH_SAFETY_MODE", "perhaps"),
            ("DISPATCH_TIMEOUT_SECONDS", "soon"),
        ]));
        assert!(config.session.safety_mode);
        assert_eq!(config.session.timeout_seconds, 60);
    }

    #[test]
    fn test_validation_rules() {
        let mut config = DispatchConfig::default();
        config.session.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.remote.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.remote.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_api_key_is_never_read_from_file() {
        let config = DispatchConfig::from_toml_str("[llm]\napi_key = \"leaked\"").unwrap();
        assert!(config.llm.api_key.is_none());
    }
}
