//! Environment-overlaid namespace data
//!
//! Every key holds a global value plus one bucket per environment. Reads
//! pick the active environment's bucket and overlay it on the global value.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Values of one data key
#[derive(Debug, Clone, Default)]
pub struct DataEntry {
    /// Value used when no environment bucket applies
    pub global: Option<Value>,
    /// Environment name to value
    pub envs: FxHashMap<String, Value>,
    /// Environment selected for this key only
    pub env: Option<String>,
}

/// Keyed data with a namespace-wide active environment
#[derive(Debug, Clone, Default)]
pub struct DataStore {
    env: Option<String>,
    entries: FxHashMap<String, DataEntry>,
}

/// `key.env` selectors split at the first dot
fn split_selector(selector: &str) -> (&str, Option<&str>) {
    match selector.split_once('.') {
        Some((key, env)) => (key, Some(env)),
        None => (selector, None),
    }
}

/// Shallow merge when both sides are objects, otherwise `over` replaces
fn overlay(base: Option<&Value>, over: &Value) -> Value {
    match (base, over) {
        (Some(Value::Object(base)), Value::Object(over)) => {
            let mut merged = base.clone();
            merged.extend(over.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        _ => over.clone(),
    }
}

impl DataStore {
    /// Namespace-wide active environment
    pub fn active_env(&self) -> Option<&str> {
        self.env.as_deref()
    }

    /// Known keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Read `key` in the effective environment, or `key.env` explicitly.
    ///
    /// The environment is the explicit one, else the key's own, else the
    /// namespace's. A missing bucket falls back to the global value.
    pub fn get(&self, selector: &str) -> Option<Value> {
        let (key, explicit) = split_selector(selector);
        let entry = self.entries.get(key)?;
        let env = explicit
            .or(entry.env.as_deref())
            .or(self.env.as_deref());

        match env.and_then(|env| entry.envs.get(env)) {
            Some(bucket) => Some(overlay(entry.global.as_ref(), bucket)),
            None => entry.global.clone(),
        }
    }

    /// Write the global value of `key`, or the `env` bucket of `key.env`.
    ///
    /// Objects are merged into an existing object; other values replace.
    pub fn set(&mut self, selector: &str, value: Value) {
        let (key, env) = split_selector(selector);
        let entry = self.entries.entry(key.to_string()).or_default();
        let slot = match env {
            Some(env) => entry.envs.get(env),
            None => entry.global.as_ref(),
        };
        let merged = overlay(slot, &value);
        match env {
            Some(env) => {
                entry.envs.insert(env.to_string(), merged);
            }
            None => entry.global = Some(merged),
        }
    }

    /// Select `env` namespace-wide, or `key.env` for one key
    pub fn set_env(&mut self, selector: &str) {
        match split_selector(selector) {
            (key, Some(env)) => {
                self.entries.entry(key.to_string()).or_default().env = Some(env.to_string());
            }
            (env, None) => self.env = Some(env.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_global_without_env() {
        let mut store = DataStore::default();
        store.set("k", json!({"a": 1}));
        assert_eq!(store.get("k"), Some(json!({"a": 1})));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_env_bucket_overlays_global() {
        let mut store = DataStore::default();
        store.set("k", json!({"a": 1, "b": 1}));
        store.set("k.dev", json!({"b": 2}));

        assert_eq!(store.get("k"), Some(json!({"a": 1, "b": 1})));
        assert_eq!(store.get("k.dev"), Some(json!({"a": 1, "b": 2})));

        store.set_env("k.dev");
        assert_eq!(store.get("k"), Some(json!({"a": 1, "b": 2})));
        assert_eq!(store.get("k.prod"), Some(json!({"a": 1, "b": 1})));
    }

    #[test]
    fn test_namespace_env_and_key_env_priority() {
        let mut store = DataStore::default();
        store.set("host", json!("prod.example"));
        store.set("host.dev", json!("localhost"));
        store.set("host.test", json!("test.example"));

        store.set_env("dev");
        assert_eq!(store.active_env(), Some("dev"));
        assert_eq!(store.get("host"), Some(json!("localhost")));

        store.set_env("host.test");
        assert_eq!(store.get("host"), Some(json!("test.example")));
    }

    #[test]
    fn test_set_merges_objects_and_keeps_global() {
        let mut store = DataStore::default();
        store.set("k", json!({"a": 1}));
        store.set("k", json!({"b": 2}));
        store.set("k.dev", json!(5));

        assert_eq!(store.get("k"), Some(json!({"a": 1, "b": 2})));
        assert_eq!(store.get("k.dev"), Some(json!(5)));
        assert_eq!(store.keys().count(), 1);
    }
}
