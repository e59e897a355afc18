//! Layered setting resolution: environment > structured file > default.
//!
//! Environment access goes through an injected lookup function. Production
//! uses [`ConfigResolver::from_process_env`]; tests pass a map so they never
//! mutate the process environment.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::error::ConfigError;
use crate::schema::{Setting, SettingDefault, SettingKind};

/// A value found for a setting, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Env(String),
    File(Value),
}

type EnvLookup<'a> = Box<dyn Fn(&str) -> Option<String> + 'a>;

pub struct ConfigResolver<'a> {
    file: &'a Value,
    env: EnvLookup<'a>,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(file: &'a Value, env: impl Fn(&str) -> Option<String> + 'a) -> Self {
        Self {
            file,
            env: Box::new(env),
        }
    }

    pub fn from_process_env(file: &'a Value) -> Self {
        Self::new(file, |name| std::env::var(name).ok())
    }

    pub fn from_map(file: &'a Value, env: &'a HashMap<String, String>) -> Self {
        Self::new(file, move |name| env.get(name).cloned())
    }

    /// Single resolution function. Blank env values and YAML nulls count as absent.
    pub fn lookup(&self, setting: &Setting) -> Option<RawValue> {
        if let Some(v) = (self.env)(&setting.env_var()) {
            if !v.trim().is_empty() {
                return Some(RawValue::Env(v));
            }
        }
        match self.file.pointer(&setting.pointer()) {
            None | Some(Value::Null) => None,
            Some(v) => Some(RawValue::File(v.clone())),
        }
    }

    /// Text value, falling back to a `Text` default. Scalars from the file are
    /// stringified (e.g. `interval_sec: 60` read as text gives `"60"`).
    pub fn text(&self, setting: &Setting) -> Result<Option<String>, ConfigError> {
        let raw = match self.lookup(setting) {
            Some(raw) => raw,
            None => return self.default_text(setting),
        };
        let s = match raw {
            RawValue::Env(s) => s,
            RawValue::File(Value::String(s)) => s,
            RawValue::File(Value::Number(n)) => n.to_string(),
            RawValue::File(Value::Bool(b)) => b.to_string(),
            RawValue::File(other) => {
                return Err(ConfigError::InvalidValue {
                    key: setting.key,
                    reason: format!("expected a scalar, got {}", kind_of(&other)),
                })
            }
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return self.default_text(setting);
        }
        Ok(Some(s))
    }

    pub fn required_text(&self, setting: &Setting) -> Result<String, ConfigError> {
        self.text(setting)?.ok_or_else(|| ConfigError::Missing {
            key: setting.key,
            env_var: setting.env_var(),
        })
    }

    /// Integer value with explicit numeric coercion.
    pub fn number(&self, setting: &Setting) -> Result<Option<i64>, ConfigError> {
        let raw = match self.lookup(setting) {
            Some(raw) => raw,
            None => {
                return match setting.default {
                    SettingDefault::Number(n) => Ok(Some(n)),
                    SettingDefault::Required => Err(missing(setting)),
                    _ => Ok(None),
                }
            }
        };
        let invalid = |value: String| ConfigError::InvalidNumber {
            key: setting.key,
            value,
        };
        match raw {
            RawValue::Env(s) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid(s)),
            RawValue::File(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(whole_f64_to_i64))
                .map(Some)
                .ok_or_else(|| invalid(n.to_string())),
            RawValue::File(Value::String(s)) => {
                s.trim().parse::<i64>().map(Some).map_err(|_| invalid(s))
            }
            RawValue::File(other) => Err(invalid(other.to_string())),
        }
    }

    /// Boolean value. Absence falls back to the table default; presence of any
    /// scalar is coerced.
    pub fn boolean(&self, setting: &Setting) -> Result<bool, ConfigError> {
        let raw = match self.lookup(setting) {
            Some(raw) => raw,
            None => {
                return match setting.default {
                    SettingDefault::Bool(b) => Ok(b),
                    SettingDefault::Required => Err(missing(setting)),
                    _ => Ok(false),
                }
            }
        };
        match raw {
            RawValue::Env(s) => Ok(coerce_bool_str(&s)),
            RawValue::File(Value::Bool(b)) => Ok(b),
            RawValue::File(Value::Number(n)) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(true)),
            RawValue::File(Value::String(s)) => Ok(coerce_bool_str(&s)),
            RawValue::File(other) => Err(ConfigError::InvalidBool {
                key: setting.key,
                value: kind_of(&other).to_string(),
            }),
        }
    }

    /// Comma-separated list (or YAML sequence) as a set of trimmed, non-empty tokens.
    pub fn list(&self, setting: &Setting) -> Result<BTreeSet<String>, ConfigError> {
        match self.lookup(setting) {
            None => Ok(BTreeSet::new()),
            Some(RawValue::Env(s)) | Some(RawValue::File(Value::String(s))) => {
                Ok(split_comma_list(&s))
            }
            Some(RawValue::File(Value::Array(items))) => {
                let mut out = BTreeSet::new();
                for item in items {
                    match item {
                        Value::String(s) => out.extend(split_comma_list(&s)),
                        other => {
                            return Err(ConfigError::InvalidValue {
                                key: setting.key,
                                reason: format!("list items must be strings, got {}", kind_of(&other)),
                            })
                        }
                    }
                }
                Ok(out)
            }
            Some(RawValue::File(other)) => Err(ConfigError::InvalidValue {
                key: setting.key,
                reason: format!("expected a comma-separated string, got {}", kind_of(&other)),
            }),
        }
    }

    /// Enum token: lower-cased and validated against the kind's token set.
    /// Returns `None` only when the setting is absent and has no text default.
    pub fn token(&self, setting: &Setting) -> Result<Option<String>, ConfigError> {
        let tokens = match setting.kind {
            SettingKind::Enum(tokens) => tokens,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: setting.key,
                    reason: "not an enum setting".to_string(),
                })
            }
        };
        let Some(value) = self.text(setting)? else {
            return Ok(None);
        };
        let lowered = value.to_lowercase();
        if tokens.contains(&lowered.as_str()) {
            Ok(Some(lowered))
        } else {
            Err(ConfigError::InvalidEnum {
                key: setting.key,
                value,
                expected: tokens.join(" | "),
            })
        }
    }

    fn default_text(&self, setting: &Setting) -> Result<Option<String>, ConfigError> {
        match setting.default {
            SettingDefault::Text(t) => Ok(Some(t.to_string())),
            SettingDefault::Number(n) => Ok(Some(n.to_string())),
            SettingDefault::Required => Err(missing(setting)),
            _ => Ok(None),
        }
    }
}

fn missing(setting: &Setting) -> ConfigError {
    ConfigError::Missing {
        key: setting.key,
        env_var: setting.env_var(),
    }
}

/// `true/yes/on/1` and `false/no/off/0` are recognised; anything else that is
/// non-empty counts as set.
/// `None` for fractional, non-finite or out-of-range values. The upper bound
/// is exclusive because `i64::MAX as f64` rounds up to 2^63.
fn whole_f64_to_i64(f: f64) -> Option<i64> {
    const LOWER: f64 = i64::MIN as f64;
    const UPPER: f64 = i64::MAX as f64;
    if f.is_finite() && f.fract() == 0.0 && (LOWER..UPPER).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

pub fn coerce_bool_str(s: &str) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => true,
        "false" | "no" | "off" | "0" | "" => false,
        _ => true,
    }
}

pub fn split_comma_list(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}
