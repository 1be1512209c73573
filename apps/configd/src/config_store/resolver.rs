use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::config_store::store::{ConfigStore, ConfigStoreError};

/// Separator for the environment-variable override convention
/// `PREFIX__CONFIG_KEY__PATH[__PATH..]=value`.
const ENV_SEPARATOR: &str = "__";

/// Read-side merge of configuration layers into one effective document.
///
/// Layers, lowest to highest: file fallback document, active global version,
/// best user override, environment-variable overrides. The user-override
/// layer replaces top-level keys wholesale — a nested object in the override
/// fully replaces the global one, never a deep merge.
///
/// Missing keys, absent users, and expired overrides all resolve to smaller
/// documents, never to errors; only store connectivity failures propagate.
pub struct ConfigResolver {
    store: Arc<dyn ConfigStore>,
    fallback: HashMap<String, Value>,
    env_prefix: String,
}

impl ConfigResolver {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        fallback: HashMap<String, Value>,
        env_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            fallback,
            env_prefix: env_prefix.into(),
        }
    }

    /// Load `<config_key>.yml|.yaml|.json` documents from a directory into
    /// the fallback layer. Unparseable files are skipped with a warning so a
    /// bad fixture cannot keep the service from starting.
    pub fn load_fallback_dir(dir: &Path) -> HashMap<String, Value> {
        let mut fallback = HashMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(dir = %dir.display(), reason = %error, "fallback config dir unavailable");
                return fallback;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            let parsed = match extension {
                "yml" | "yaml" => std::fs::read_to_string(&path)
                    .map_err(|error| error.to_string())
                    .and_then(|text| {
                        serde_yaml::from_str::<Value>(&text).map_err(|error| error.to_string())
                    }),
                "json" => std::fs::read_to_string(&path)
                    .map_err(|error| error.to_string())
                    .and_then(|text| {
                        serde_json::from_str::<Value>(&text).map_err(|error| error.to_string())
                    }),
                _ => continue,
            };
            match parsed {
                Ok(document) => {
                    tracing::debug!(config_key = stem, path = %path.display(), "loaded fallback config");
                    fallback.insert(stem.to_string(), document);
                }
                Err(reason) => {
                    tracing::warn!(path = %path.display(), reason, "skipping unparseable fallback config");
                }
            }
        }
        fallback
    }

    pub async fn resolve(
        &self,
        config_key: &str,
        user_id: Option<&str>,
        environment: &str,
    ) -> Result<Value, ConfigStoreError> {
        let mut document = Map::new();

        if let Some(fallback) = self.fallback.get(config_key) {
            apply_layer(&mut document, fallback);
        }

        if let Some(active) = self
            .store
            .get_active_payload(config_key, environment)
            .await?
        {
            apply_layer(&mut document, &active);
        }

        if let Some(user_id) = user_id {
            if let Some(row) = self
                .store
                .best_override(user_id, config_key, Utc::now())
                .await?
            {
                apply_layer(&mut document, &row.value);
            }
        }

        for (path, value) in env_overrides(&self.env_prefix, config_key, std::env::vars()) {
            set_path(&mut document, &path, value);
        }

        Ok(Value::Object(document))
    }
}

/// Replace top-level keys of `document` with the layer's keys, wholesale.
/// Non-object layers cannot contribute top-level keys and are ignored.
pub fn apply_layer(document: &mut Map<String, Value>, layer: &Value) {
    match layer {
        Value::Object(entries) => {
            for (key, value) in entries {
                document.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            tracing::warn!(kind = json_kind(other), "ignoring non-object config layer");
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extract `(nested path, typed value)` pairs for one config key from an
/// environment-variable iterator. `COMPANION__MEMORY__SEARCH__LIMIT=5` with
/// prefix `COMPANION` and key `memory` yields (["search", "limit"], 5).
pub fn env_overrides(
    prefix: &str,
    config_key: &str,
    vars: impl Iterator<Item = (String, String)>,
) -> Vec<(Vec<String>, Value)> {
    let wanted = format!(
        "{}{}{}{}",
        prefix.to_uppercase(),
        ENV_SEPARATOR,
        config_key.to_uppercase(),
        ENV_SEPARATOR
    );
    let mut overrides = Vec::new();
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(&wanted) else {
            continue;
        };
        let path: Vec<String> = rest
            .split(ENV_SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.to_lowercase())
            .collect();
        if path.is_empty() {
            continue;
        }
        overrides.push((path, parse_env_value(&raw)));
    }
    // Deterministic application order regardless of process env iteration.
    overrides.sort_by(|a, b| a.0.cmp(&b.0));
    overrides
}

/// Parse an env-var string into the most specific JSON value it can carry:
/// bool, null, int, float, inline JSON, else string.
pub fn parse_env_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match trimmed.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" | "nil" => return Value::Null,
        _ => {}
    }
    if (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('{') && trimmed.ends_with('}'))
    {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

/// Set one leaf at a nested path, creating intermediate objects and
/// replacing non-object intermediates.
pub fn set_path(document: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };
    let mut current = document;
    for segment in parents {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(next) => current = next,
            _ => return,
        }
    }
    current.insert(leaf.clone(), value);
}
