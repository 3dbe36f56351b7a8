//! JSON module manifests
//!
//! Scripts served by the file and HTTP fetchers are JSON documents that
//! describe the namespace they populate and the modules they define.
//!
//! ```json
//! {
//!   "namespace": "game",
//!   "config": { "modules": { "tween": "tween.json" } },
//!   "modules": [
//!     { "id": "a", "exports": 2 },
//!     { "id": "sum", "dependencies": ["a", "tween"], "factory": "collect" }
//!   ]
//! }
//! ```

use crate::error::FetchError;
use crate::module::{Exports, Factory};
use crate::namespace::{Meta, Namespace, NamespaceConfig};
use crate::runtime::Runtime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// How a declared module computes its exports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFactory {
    /// `exports` verbatim
    #[default]
    Value,
    /// JSON array of the dependency exports in order
    Collect,
    /// Shallow merge of every object dependency, then `exports`
    Merge,
}

/// One module declared by a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDecl {
    /// Module id within the manifest's namespace
    pub id: String,
    /// Dependency ids in factory argument order
    pub dependencies: Vec<String>,
    /// Exported value, or the own part of a `merge`
    pub exports: Value,
    /// How exports are computed
    pub factory: ManifestFactory,
}

impl ModuleDecl {
    fn to_factory(&self) -> Factory {
        let exports = self.exports.clone();
        match self.factory {
            ManifestFactory::Value if exports.is_null() => Factory::empty(),
            ManifestFactory::Value => Factory::Value(Exports::from(exports)),
            ManifestFactory::Collect => Factory::from_fn(|dependencies| {
                let values = dependencies
                    .iter()
                    .map(|exports| exports.as_json().cloned().unwrap_or(Value::Null))
                    .collect();
                Exports::from(Value::Array(values))
            }),
            ManifestFactory::Merge => Factory::from_fn(move |dependencies| {
                let mut merged = Map::new();
                for dependency in dependencies {
                    if let Some(Value::Object(fields)) = dependency.as_json() {
                        merged.extend(fields.clone());
                    }
                }
                if let Value::Object(own) = &exports {
                    merged.extend(own.clone());
                }
                Exports::from(Value::Object(merged))
            }),
        }
    }
}

/// A parsed script file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleManifest {
    /// Namespace to populate; the root when omitted
    pub namespace: Option<String>,
    /// Registered parent for a newly created namespace; the root when omitted
    pub parent: Option<String>,
    /// Merged into the namespace resolution table
    pub config: Option<NamespaceConfig>,
    /// Merged into the namespace metadata
    pub meta: Option<Meta>,
    /// Selector to value, applied with `set_data`
    pub data: BTreeMap<String, Value>,
    /// Env selector activated after `data` is applied
    pub env: Option<String>,
    /// Modules to define, in order
    pub modules: Vec<ModuleDecl>,
}

impl ModuleManifest {
    /// Parse the body served at `url`
    pub fn parse(url: &str, body: &str) -> Result<Self, FetchError> {
        serde_json::from_str(body).map_err(|error| FetchError::Manifest {
            url: url.to_string(),
            error,
        })
    }

    /// Register everything the manifest declares on `runtime`
    pub fn apply(&self, runtime: &Runtime, url: &str) -> Result<Namespace, FetchError> {
        let script_error = |message: String| FetchError::Script {
            url: url.to_string(),
            message,
        };

        let namespace = match &self.namespace {
            None => runtime.root(),
            Some(name) => {
                let parent = match &self.parent {
                    Some(parent) => runtime
                        .require_namespace(parent)
                        .map_err(|e| script_error(e.to_string()))?,
                    None => runtime.root(),
                };
                parent
                    .namespace(name)
                    .map_err(|e| script_error(e.to_string()))?
            }
        };

        if let Some(config) = &self.config {
            namespace.config(config.clone());
        }
        if let Some(meta) = &self.meta {
            namespace.set_meta(meta.clone());
        }
        for (selector, value) in &self.data {
            namespace.set_data(selector, value.clone());
        }
        if let Some(env) = &self.env {
            namespace.env(env);
        }

        for decl in &self.modules {
            if decl.id.is_empty() {
                return Err(script_error("module declared without an id".to_string()));
            }
            let dependencies: Vec<&str> = decl.dependencies.iter().map(String::as_str).collect();
            namespace
                .define(&decl.id, &dependencies, decl.to_factory())
                .map_err(|e| script_error(e.to_string()))?;
        }

        debug!(
            "Applied manifest {} to namespace {} ({} modules)",
            url,
            namespace.name(),
            self.modules.len()
        );
        Ok(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::RuntimeEvent;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ModuleManifest::parse("/x.json", "{ nope"),
            Err(FetchError::Manifest { .. })
        ));
    }

    #[test]
    fn test_apply_creates_namespace_and_modules() {
        let runtime = Runtime::new(MemoryFetcher::new());
        let manifest = ModuleManifest::parse(
            "/game.json",
            r#"{
                "namespace": "game",
                "meta": { "version": "2.0" },
                "data": { "speed": 1, "speed.fast": 9 },
                "env": "speed.fast",
                "modules": [
                    { "id": "a", "exports": 2 },
                    { "id": "b", "exports": 3 },
                    { "id": "pair", "dependencies": ["a", "b"], "factory": "collect" }
                ]
            }"#,
        )
        .unwrap();

        let game = manifest.apply(&runtime, "/game.json").unwrap();
        assert_eq!(game.name(), "game");
        assert_eq!(game.parent().unwrap().name(), "eco");
        assert_eq!(game.meta().version.as_deref(), Some("2.0"));
        assert_eq!(game.data("speed"), Some(json!(9)));

        runtime.emit(RuntimeEvent::LoadDependencies);
        let pair = game.module("pair").unwrap().exec().unwrap();
        assert_eq!(pair.as_json(), Some(&json!([2, 3])));
    }

    #[test]
    fn test_merge_factory() {
        let runtime = Runtime::new(MemoryFetcher::new());
        let manifest: ModuleManifest = serde_json::from_value(json!({
            "modules": [
                { "id": "base", "exports": { "a": 1, "b": 1 } },
                { "id": "over", "dependencies": ["base"], "exports": { "b": 2 }, "factory": "merge" }
            ]
        }))
        .unwrap();
        manifest.apply(&runtime, "/m.json").unwrap();

        let over = runtime.root().module("over").unwrap().exec().unwrap();
        assert_eq!(over.as_json(), Some(&json!({ "a": 1, "b": 2 })));
    }

    #[test]
    fn test_unknown_parent_is_a_script_error() {
        let runtime = Runtime::new(MemoryFetcher::new());
        let manifest: ModuleManifest =
            serde_json::from_value(json!({ "namespace": "ui", "parent": "ghost" })).unwrap();
        assert!(matches!(
            manifest.apply(&runtime, "/ui.json"),
            Err(FetchError::Script { .. })
        ));
    }
}
