//! Configuration module.
//!
//! Handles dispatcher configuration, the optional TOML settings file, and
//! environment variable expansion.

mod settings;

pub use settings::{
    default_language, expand_env_vars, language_from_locale, normalize_base_path,
    DispatcherConfig, Settings, SettingsError, DEFAULT_BASE_PATH, WORKER_FILENAME,
};
