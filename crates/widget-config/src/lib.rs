#![warn(missing_docs)]

//! # widget-config
//!
//! Configuration loading for widget sandbox hosts.
//!
//! Supports TOML configuration files with environment variable expansion.
//! `${VAR}` is expanded in every string value except widget `script` bodies,
//! where it is JavaScript template-literal syntax and is kept verbatim.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_secs = 10
//! max_heap_mb = 64
//! execution_mode = "child_process"
//!
//! [[widgets]]
//! name = "Weather"
//! icon = "☀"
//! url = "https://wttr.in"
//! refresh_interval_secs = 600
//! script = """
//! const body = await fetchData('https://wttr.in/?format=%t');
//! return { value: body.trim(), label: 'Berlin' };
//! """
//!
//! [[widgets]]
//! name = "Ticker"
//! url = "https://quotes.example.com/${QUOTE_ACCOUNT}"
//! script = "return { value: `${await fetchData('https://api.example.com/quote')} USD` };"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "WIDGET_CONFIG";

/// Config file looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "widgets.toml";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WidgetsConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Configured quick-link widgets, in display order.
    #[serde(default)]
    pub widgets: Vec<WidgetEntry>,
}

/// How the isolated environment is hosted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A separate `widget-worker` process (default).
    #[default]
    ChildProcess,
    /// A dedicated thread inside the host process.
    InProcess,
}

/// Sandbox configuration overrides. Absent keys keep the library defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Script execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// How long to wait for the sandbox to become ready, in seconds.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum IPC frame size in megabytes.
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,

    /// Execution mode: "child_process" (default) or "in_process".
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
}

/// One `[[widgets]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct WidgetEntry {
    /// Display name; must be unique.
    pub name: String,

    /// Script body.
    #[serde(default)]
    pub script: String,

    /// Icon or emoji.
    #[serde(default)]
    pub icon: String,

    /// Link opened from the tile.
    #[serde(default)]
    pub url: String,

    /// Re-run period in seconds; `0` disables refreshing.
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

impl WidgetsConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: WidgetsConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references
    /// in string values other than widget scripts.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml_str.parse()?;
        expand_table(&mut table);
        let config: WidgetsConfig = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// Find the config file to load.
    ///
    /// Order: `explicit`, then `$WIDGET_CONFIG`, then `./widgets.toml` if it
    /// exists. `None` means run with defaults.
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        locate_from(explicit, std::env::var_os(CONFIG_ENV).map(PathBuf::from), &cwd)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        for (key, value) in [
            ("timeout_secs", sandbox.timeout_secs),
            ("startup_timeout_secs", sandbox.startup_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{key} must be greater than zero"
                )));
            }
        }
        for (key, value) in [
            ("max_heap_mb", sandbox.max_heap_mb),
            ("max_code_kb", sandbox.max_code_kb),
            ("max_ipc_message_size_mb", sandbox.max_ipc_message_size_mb),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{key} must be greater than zero"
                )));
            }
        }

        let mut seen = HashSet::new();
        for (index, widget) in self.widgets.iter().enumerate() {
            if widget.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "widget #{}: name must not be empty",
                    index + 1
                )));
            }
            if !seen.insert(widget.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "widget '{}': duplicate name",
                    widget.name
                )));
            }
        }
        Ok(())
    }
}

fn locate_from(explicit: Option<&Path>, env_value: Option<PathBuf>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_value.filter(|p| !p.as_os_str().is_empty()) {
        return Some(path);
    }
    let default = cwd.join(DEFAULT_CONFIG_FILE);
    default.is_file().then_some(default)
}

fn expand_table(table: &mut toml::Table) {
    for (key, value) in table.iter_mut() {
        if key == "script" {
            continue;
        }
        expand_value(value);
    }
}

fn expand_value(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => *s = expand_env_vars(s),
        toml::Value::Array(items) => items.iter_mut().for_each(expand_value),
        toml::Value::Table(table) => expand_table(table),
        _ => {}
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Leave the placeholder if env var not found
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
