//! Configuration error taxonomy.
//!
//! Every variant is fatal at startup. Messages carry a stable `CONFIG_*` code
//! so operators can grep logs, and reference setting keys / env var NAMES only.
//! Values are echoed for enum/number/duration errors but never for the API key.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("CONFIG_MISSING: required setting {key} is not set (env {env_var})")]
    Missing { key: &'static str, env_var: String },

    #[error("CONFIG_INVALID_ENUM: {key}={value:?} is not one of: {expected}")]
    InvalidEnum {
        key: &'static str,
        value: String,
        expected: String,
    },

    #[error("CONFIG_INVALID_NUMBER: {key}={value:?} is not an integer")]
    InvalidNumber { key: &'static str, value: String },

    #[error("CONFIG_INVALID_BOOL: {key} must be a scalar, got {value}")]
    InvalidBool { key: &'static str, value: String },

    #[error("CONFIG_INVALID_DURATION: {key}={value:?}: {reason}")]
    InvalidDuration {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("CONFIG_INVALID_TIMESTAMP: {key}={value:?} is neither RFC 3339, YYYY-MM-DDTHH:MM:SS nor epoch seconds")]
    InvalidTimestamp { key: &'static str, value: String },

    #[error("CONFIG_INVALID_VALUE: {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("CONFIG_UNREADABLE: {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("CONFIG_INVALID_YAML: {0}")]
    Yaml(String),

    #[error(
        "CONFIG_UNKNOWN_KEYS: {count} unknown config key(s) under connector/alienvault. First few: {preview}"
    )]
    UnknownKeys { count: usize, preview: String },
}
