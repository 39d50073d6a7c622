//! TOML-based configuration for the dispatcher.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration. Paths support environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [dispatcher]
//! base_path = "/docs/pagefind/"
//! language = "en"
//! no_worker = false
//! init_timeout_ms = 5000
//! handle_capacity = 4096
//! worker_path = "${PAGEFIND_HOME}/bin/pagefind-worker"
//!
//! [dispatcher.engine]
//! excerptLength = 30
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::IndexOptions;

/// Base path used when none is configured.
pub const DEFAULT_BASE_PATH: &str = "/pagefind/";

/// File name of the worker, appended to the normalized base path.
pub const WORKER_FILENAME: &str = "pagefind-worker";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root of the settings file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub dispatcher: DispatcherConfig,
}

/// Everything a [`Dispatcher`](crate::worker::Dispatcher) is constructed from.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Where the index and the worker live. Normalized on use.
    pub base_path: Option<String>,

    /// Index language. Falls back to the `LANG` locale, then `"unknown"`.
    pub language: Option<String>,

    /// Never start a worker; run everything in-process.
    pub no_worker: bool,

    /// The caller's own origin (`scheme://host[:port]`). A base path that
    /// starts with it is rewritten to be path-relative.
    pub origin: Option<String>,

    /// Bound on the initialization handshake.
    pub init_timeout_ms: u64,

    /// Optional bound on every other worker call. Unbounded when unset.
    pub call_timeout_ms: Option<u64>,

    /// Maximum number of retained data handles per engine instance.
    pub handle_capacity: usize,

    /// Explicit worker executable, overriding `<base_path>pagefind-worker`.
    pub worker_path: Option<String>,

    /// Engine-specific options passed through to the engine factory.
    pub engine: IndexOptions,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            language: None,
            no_worker: false,
            origin: None,
            init_timeout_ms: 5000,
            call_timeout_ms: None,
            handle_capacity: 4096,
            worker_path: None,
            engine: IndexOptions::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn without_worker(mut self) -> Self {
        self.no_worker = true;
        self
    }

    /// The base path with a single trailing separator and no leading origin.
    pub fn resolved_base_path(&self) -> String {
        normalize_base_path(self.base_path.as_deref(), self.origin.as_deref())
    }

    /// The configured language, or the environment's.
    pub fn resolved_language(&self) -> String {
        match self.language.as_deref() {
            Some(language) if !language.trim().is_empty() => language.trim().to_lowercase(),
            _ => default_language(),
        }
    }

    /// Where the worker is started from.
    pub fn worker_location(&self) -> Result<String, SettingsError> {
        match &self.worker_path {
            Some(path) => expand_env_vars(path),
            None => Ok(format!("{}{}", self.resolved_base_path(), WORKER_FILENAME)),
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Options handed to the engine factory: the passthrough options with the
    /// resolved base path and language filled in.
    pub fn engine_options(&self) -> IndexOptions {
        IndexOptions {
            base_path: Some(self.resolved_base_path()),
            language: Some(self.resolved_language()),
            ..self.engine.clone()
        }
    }

    /// Reject values the dispatcher cannot work with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.handle_capacity == 0 {
            return Err(SettingsError::InvalidConfig(
                "handle_capacity must be at least 1".to_string(),
            ));
        }
        if self.init_timeout_ms == 0 {
            return Err(SettingsError::InvalidConfig(
                "init_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let mut settings: Settings = toml::from_str(content)?;
        if let Some(base_path) = &settings.dispatcher.base_path {
            settings.dispatcher.base_path = Some(expand_env_vars(base_path)?);
        }
        settings.dispatcher.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `PAGEFIND_DISPATCH_CONFIG`
    /// 2. `./pagefind.toml`
    /// 3. `~/.config/pagefind/dispatch.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("PAGEFIND_DISPATCH_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("pagefind.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pagefind").join("dispatch.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Give a base path exactly one trailing `/` and strip a leading `origin`.
///
/// An empty or missing base path becomes [`DEFAULT_BASE_PATH`].
pub fn normalize_base_path(base_path: Option<&str>, origin: Option<&str>) -> String {
    let mut path = match base_path {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => DEFAULT_BASE_PATH.to_string(),
    };

    if !path.ends_with('/') {
        path.push('/');
    }

    if let Some(origin) = origin.map(|o| o.trim_end_matches('/')) {
        if !origin.is_empty() {
            if let Some(rest) = path.strip_prefix(origin) {
                path = rest.to_string();
            }
        }
    }

    path
}

/// Language derived from the process locale.
pub fn default_language() -> String {
    env::var("LC_ALL")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| env::var("LANG").ok())
        .map(|locale| language_from_locale(&locale))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Turn a POSIX locale (`en_US.UTF-8`) into a language tag (`en-us`).
pub fn language_from_locale(locale: &str) -> String {
    let tag = locale.split(['.', '@']).next().unwrap_or_default().trim();
    if tag.is_empty() || tag == "C" || tag == "POSIX" {
        return "unknown".to_string();
    }
    tag.replace('_', "-").to_lowercase()
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                var_name.push(ch);
            }
            if var_name.is_empty() {
                // A lone $ stays as-is
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
