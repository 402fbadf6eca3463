//! config-rs/lib.rs
//! Shared configuration utilities for the dispatch engine
//! Provides the layered `DispatchConfig` (TOML file, then environment) and
//! the small env parsing helpers it is built from

mod dispatch;

pub use dispatch::{
    generate_device_id, ConfigError, DeviceConfig, DispatchConfig, ExecutorSettings,
    HistorySettings, LlmSettings, LoggingSettings, RemoteSettings, SessionSettings,
    DEFAULT_CONFIG_PATH,
};

use std::env;

/// Read a non-empty environment variable
///
/// # Arguments
/// * `name` - The variable name (e.g., "LLM_MODEL")
///
/// # Returns
/// The value, or `None` when unset or blank
pub fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a boolean flag value
///
/// Accepts `1|true|yes|on` and `0|false|no|off` in any case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
