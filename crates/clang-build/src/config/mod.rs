//! Layered JSON build configuration.
//!
//! Configuration files are merged in command-line order:
//! - scalars from later files override earlier ones
//! - lists are unioned, keeping first-seen order
//! - `null` removes a key set by an earlier file
//! - a value of a different JSON kind is rejected
//! - objects can be introduced but never overridden
//!
//! A key reset by `null` remembers the reset, so merging a pre-merged
//! config behaves the same as merging its files one by one.

mod options;

pub use options::{BuildOptions, BuildType, ClangTidy};

use crate::error::BuildError;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Keys the builder understands. Anything else is warned about and ignored.
pub const KNOWN_KEYS: &[&str] = &[
    "cc",
    "cxx",
    "as",
    "ml",
    "ar",
    "lib",
    "ranlib",
    "libtool",
    "llvm-profdata",
    "patches",
    "stages",
    "skip_stages",
    "pgo",
    "build_type",
    "targets",
    "build_clang_tidy",
    "build_clang_tidy_alpha",
    "build_clang_tidy_external",
    "assertions",
    "target",
];

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    /// A `null` override happened somewhere in this entry's history.
    reset: bool,
    value: Option<Value>,
}

impl Entry {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self {
                reset: true,
                value: None,
            },
            Value::Array(items) => Self {
                reset: false,
                value: Some(Value::Array(union(Vec::new(), items))),
            },
            other => Self {
                reset: false,
                value: Some(other),
            },
        }
    }
}

/// Merged configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    entries: BTreeMap<String, Entry>,
}

impl Config {
    /// Build a config from a single JSON document.
    pub fn from_value(source_name: &str, doc: Value) -> Result<Self> {
        let Value::Object(map) = doc else {
            return Err(BuildError::ConfigValidation(format!(
                "{source_name} must contain a JSON object"
            ))
            .into());
        };
        Ok(Self::from_map(map))
    }

    fn from_map(map: Map<String, Value>) -> Self {
        let entries = map
            .into_iter()
            .map(|(key, value)| (key, Entry::from_value(value)))
            .collect();
        Self { entries }
    }

    /// Load a config file. Relative `patches` are resolved against the
    /// directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut doc: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if let Some(Value::Array(patches)) = doc.get_mut("patches") {
            let dir = path.parent().unwrap_or_else(|| Path::new(""));
            for patch in patches.iter_mut() {
                if let Value::String(p) = patch {
                    *p = dir.join(&*p).to_string_lossy().into_owned();
                }
            }
        }

        Self::from_value(&path.display().to_string(), doc)
    }

    /// Merge `later` on top of `self`.
    pub fn merge(&mut self, source_name: &str, later: Config) -> Result<()> {
        for (key, new) in later.entries {
            if new.reset {
                self.entries.insert(key, new);
                continue;
            }
            let Some(new_value) = new.value else {
                continue;
            };

            let Some(old) = self.entries.get_mut(&key) else {
                self.entries.insert(
                    key,
                    Entry {
                        reset: false,
                        value: Some(new_value),
                    },
                );
                continue;
            };

            let merged = match old.value.take() {
                None => new_value,
                Some(old_value) => merge_value(source_name, &key, old_value, new_value)?,
            };
            old.value = Some(merged);
        }
        Ok(())
    }

    /// Value for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys that are currently set.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.value.is_some())
            .map(|(k, _)| k.as_str())
    }

    /// String value for `key`. Fails if the key holds something else.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(BuildError::ConfigValidation(format!(
                "`{key}` must be a string, got {other}"
            ))
            .into()),
        }
    }

    /// Render the visible configuration as a JSON object.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .filter_map(|(k, e)| e.value.clone().map(|v| (k.clone(), v)))
            .collect();
        Value::Object(map)
    }

    /// Log a warning for keys the builder does not know about.
    pub fn warn_unknown_keys(&self) {
        for key in self.keys() {
            if !KNOWN_KEYS.contains(&key) {
                log::warn!("Ignoring unknown configuration key `{key}`");
            }
        }
    }
}

/// Merge configuration documents in order; later documents win.
pub fn merge_all<I>(docs: I) -> Result<Config>
where
    I: IntoIterator<Item = (String, Config)>,
{
    let mut config = Config::default();
    for (name, doc) in docs {
        config.merge(&name, doc)?;
    }
    Ok(config)
}

fn merge_value(source_name: &str, key: &str, old: Value, new: Value) -> Result<Value> {
    if kind(&old) != kind(&new) {
        return Err(BuildError::ConfigTypeConflict {
            key: key.to_string(),
            source_name: source_name.to_string(),
        }
        .into());
    }
    match (old, new) {
        (Value::Array(old), Value::Array(new)) => Ok(Value::Array(union(old, new))),
        (Value::Object(_), Value::Object(_)) => Err(BuildError::ConfigValidation(format!(
            "{source_name} is setting `{key}` to a dict"
        ))
        .into()),
        (_, new) => Ok(new),
    }
}

fn union(mut acc: Vec<Value>, items: Vec<Value>) -> Vec<Value> {
    for item in items {
        if !acc.contains(&item) {
            acc.push(item);
        }
    }
    acc
}

/// JSON kind, with integers and floats kept apart.
fn kind(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(n) if n.is_f64() => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}
