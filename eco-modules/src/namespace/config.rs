//! Namespace resolution tables and metadata

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// URL table used to synthesize virtual modules and locate namespace files.
///
/// Relative paths are appended to `base`; the `full_*` tables hold absolute
/// URLs that are used as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamespaceConfig {
    /// Prefix for relative paths, `/` when unset
    pub base: Option<String>,
    /// Module id to path relative to `base`
    pub modules: BTreeMap<String, String>,
    /// Module id to absolute URL
    pub full_modules: BTreeMap<String, String>,
    /// Namespace name to path relative to `base`
    pub name_spaces: BTreeMap<String, String>,
    /// Namespace name to absolute URL
    pub full_name_spaces: BTreeMap<String, String>,
}

impl NamespaceConfig {
    /// Effective base prefix
    pub fn base(&self) -> &str {
        self.base.as_deref().unwrap_or("/")
    }

    /// Merge `patch` key by key; later values win
    pub fn merge(&mut self, patch: NamespaceConfig) {
        if patch.base.is_some() {
            self.base = patch.base;
        }
        self.modules.extend(patch.modules);
        self.full_modules.extend(patch.full_modules);
        self.name_spaces.extend(patch.name_spaces);
        self.full_name_spaces.extend(patch.full_name_spaces);
    }

    /// URL of the file backing module `id`
    pub fn module_url(&self, id: &str) -> Option<String> {
        Self::lookup(self.base(), &self.modules, &self.full_modules, id)
    }

    /// URL of the file registering namespace `name`
    pub fn namespace_url(&self, name: &str) -> Option<String> {
        Self::lookup(self.base(), &self.name_spaces, &self.full_name_spaces, name)
    }

    fn lookup(
        base: &str,
        relative: &BTreeMap<String, String>,
        full: &BTreeMap<String, String>,
        key: &str,
    ) -> Option<String> {
        relative
            .get(key)
            .map(|path| format!("{}{}", base, path))
            .or_else(|| full.get(key).cloned())
    }

    /// Whether nothing is configured
    pub fn is_empty(&self) -> bool {
        self.base.is_none()
            && self.modules.is_empty()
            && self.full_modules.is_empty()
            && self.name_spaces.is_empty()
            && self.full_name_spaces.is_empty()
    }
}

/// Descriptive namespace metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    /// Display name
    pub name: Option<String>,
    /// Version string, free form
    pub version: Option<String>,
    /// One-line summary
    pub description: Option<String>,
    /// Primary author
    pub author: Option<String>,
    /// Additional contributors
    pub participator: Option<String>,
}

impl Meta {
    /// Overwrite every field set in `patch`
    pub fn merge(&mut self, patch: Meta) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.name, patch.name);
        take(&mut self.version, patch.version);
        take(&mut self.description, patch.description);
        take(&mut self.author, patch.author);
        take(&mut self.participator, patch.participator);
    }
}
