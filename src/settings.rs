use crate::model::ConflictPolicy;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Read-only, sectioned configuration document. The engine reads it once at
/// construction and never writes back; persistence of edits belongs to the
/// embedding application.
///
/// `get` searches every section for the key; `get_section` returns one
/// section's map.
#[derive(Clone)]
pub struct SettingsStore {
  doc: Arc<Value>,
}

impl SettingsStore {
  pub fn with_defaults() -> Self {
    Self { doc: Arc::new(default_document()) }
  }

  /// Loads a settings JSON file, merging its sections over the built-in
  /// defaults so partial documents stay usable.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let loaded: Value = serde_json::from_str(&raw)
      .with_context(|| format!("settings file {} is not valid JSON", path.display()))?;
    Ok(Self::from_value(loaded))
  }

  /// Builds a store from an in-memory document, merged over defaults.
  /// Unknown sections are kept verbatim.
  pub fn from_value(overrides: Value) -> Self {
    let mut doc = default_document();
    if let (Some(base), Some(over)) = (doc.as_object_mut(), overrides.as_object()) {
      for (section, values) in over {
        match (base.get_mut(section).and_then(Value::as_object_mut), values.as_object()) {
          (Some(existing), Some(incoming)) => {
            for (k, v) in incoming {
              existing.insert(k.clone(), v.clone());
            }
          }
          _ => {
            base.insert(section.clone(), values.clone());
          }
        }
      }
    }
    Self { doc: Arc::new(doc) }
  }

  /// Looks `key` up across all sections; returns `default` when the key is
  /// missing or has an incompatible type.
  pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
    let Some(sections) = self.doc.as_object() else {
      return default;
    };
    for section in sections.values() {
      if let Some(found) = section.as_object().and_then(|m| m.get(key)) {
        if let Ok(value) = serde_json::from_value(found.clone()) {
          return value;
        }
        return default;
      }
    }
    default
  }

  pub fn get_section(&self, name: &str) -> Map<String, Value> {
    self
      .doc
      .as_object()
      .and_then(|m| m.get(name))
      .and_then(Value::as_object)
      .cloned()
      .unwrap_or_default()
  }
}

fn default_document() -> Value {
  json!({
    "general": {
      "language": "English",
      "theme": "System",
      "notifications": true,
      "download_folder": default_download_folder().display().to_string(),
    },
    "download": {
      "max_downloads": 3,
      "speed_limit": 0,
      "auto_extract": true,
      "verify_hash": true,
      "file_conflict": "Auto rename",
      "chunk_enabled": true,
      "chunk_count": 4,
      "chunk_min_size": 10,
    },
    "connection": {
      "connection_timeout": 30,
      "retry_count": 3,
      "retry_delay": 5,
      "user_agent_type": "Browser default",
      "custom_user_agent": "",
      "send_referer": true,
    },
    "security": {
      "scan_downloads": false,
    },
    "privacy": {},
  })
}

fn default_download_folder() -> PathBuf {
  dirs::download_dir()
    .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
    .unwrap_or_else(|| PathBuf::from("."))
}

/// Snapshot of every setting the engine consumes, materialized once at
/// construction. Worker count and chunk policy do not change at runtime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub max_downloads: usize,
  /// KiB/s; 0 disables the limiter.
  pub speed_limit: i64,
  pub chunk_enabled: bool,
  pub chunk_count: usize,
  /// Bytes, converted from the `chunk_min_size` megabyte setting.
  pub chunk_min_size: i64,
  pub auto_extract: bool,
  pub verify_hash: bool,
  pub file_conflict: ConflictPolicy,
  pub connection_timeout: Duration,
  pub retry_count: u32,
  pub retry_delay: Duration,
  pub user_agent_type: String,
  pub custom_user_agent: String,
  pub send_referer: bool,
  pub download_folder: PathBuf,
}

impl EngineConfig {
  pub fn from_settings(settings: &SettingsStore) -> Self {
    let chunk_min_mb: f64 = settings.get("chunk_min_size", 10.0);
    Self {
      max_downloads: settings.get::<i64>("max_downloads", 3).max(1) as usize,
      speed_limit: settings.get("speed_limit", 0),
      chunk_enabled: settings.get("chunk_enabled", true),
      chunk_count: settings.get::<i64>("chunk_count", 4).max(1) as usize,
      chunk_min_size: (chunk_min_mb * 1024.0 * 1024.0) as i64,
      auto_extract: settings.get("auto_extract", true),
      verify_hash: settings.get("verify_hash", true),
      file_conflict: ConflictPolicy::from_setting(
        &settings.get("file_conflict", "Auto rename".to_string()),
      ),
      connection_timeout: Duration::from_secs(
        settings.get::<i64>("connection_timeout", 30).max(1) as u64,
      ),
      retry_count: settings.get::<i64>("retry_count", 3).max(0) as u32,
      retry_delay: Duration::from_secs_f64(settings.get::<f64>("retry_delay", 5.0).max(0.0)),
      user_agent_type: settings.get("user_agent_type", "Browser default".to_string()),
      custom_user_agent: settings.get("custom_user_agent", String::new()),
      send_referer: settings.get("send_referer", true),
      download_folder: PathBuf::from(settings.get(
        "download_folder",
        default_download_folder().display().to_string(),
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn get_searches_all_sections() {
    let store = SettingsStore::with_defaults();
    // download section
    assert_eq!(store.get::<i64>("max_downloads", 0), 3);
    // connection section
    assert_eq!(store.get::<i64>("retry_count", 0), 3);
    // missing key
    assert_eq!(store.get::<i64>("no_such_key", 42), 42);
  }

  #[test]
  fn overrides_merge_section_wise() {
    let store = SettingsStore::from_value(json!({
      "download": { "max_downloads": 8 },
      "privacy": { "relay_enabled": true },
    }));
    assert_eq!(store.get::<i64>("max_downloads", 0), 8);
    // untouched sibling key survives
    assert_eq!(store.get::<i64>("chunk_count", 0), 4);
    assert_eq!(store.get("relay_enabled", false), true);
  }

  #[test]
  fn get_section_returns_one_section() {
    let store = SettingsStore::from_value(json!({
      "privacy": { "relay_port": 9050 },
    }));
    let section = store.get_section("privacy");
    assert_eq!(section.get("relay_port").and_then(Value::as_i64), Some(9050));
    assert!(store.get_section("nonexistent").is_empty());
  }

  #[test]
  fn config_converts_units() {
    let store = SettingsStore::from_value(json!({
      "download": { "chunk_min_size": 0.5 },
      "connection": { "connection_timeout": 10, "retry_delay": 0.25 },
    }));
    let cfg = EngineConfig::from_settings(&store);
    assert_eq!(cfg.chunk_min_size, 512 * 1024);
    assert_eq!(cfg.connection_timeout, Duration::from_secs(10));
    assert_eq!(cfg.retry_delay, Duration::from_millis(250));
  }

  #[test]
  fn config_clamps_degenerate_values() {
    let store = SettingsStore::from_value(json!({
      "download": { "max_downloads": 0, "chunk_count": -2 },
      "connection": { "retry_count": -1 },
    }));
    let cfg = EngineConfig::from_settings(&store);
    assert_eq!(cfg.max_downloads, 1);
    assert_eq!(cfg.chunk_count, 1);
    assert_eq!(cfg.retry_count, 0);
  }

  #[test]
  fn type_mismatch_falls_back_to_default() {
    let store = SettingsStore::from_value(json!({
      "download": { "max_downloads": "lots" },
    }));
    assert_eq!(store.get::<i64>("max_downloads", 3), 3);
  }
}
