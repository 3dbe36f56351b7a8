//! Configuration handling for the Eco CLI

use anyhow::{Context, Result};
use eco_modules::{NamespaceConfig, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const CONFIG_FILE: &str = "eco.toml";

/// Contents of `eco.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory served by the file fetcher
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Base URL served by the HTTP fetcher; takes precedence over `root`
    #[serde(default)]
    pub remote: Option<String>,

    /// Manifest applied before any command runs
    #[serde(default)]
    pub entry: Option<String>,

    /// Settings of the runtime itself
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Resolution table of the root namespace
    #[serde(default)]
    pub namespace: NamespaceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            remote: None,
            entry: None,
            runtime: RuntimeConfig::default(),
            namespace: NamespaceConfig::default(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Load configuration from `path`, `./eco.toml`, `~/.eco/eco.toml`, or
/// use defaults
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = path {
        return read_config(&path);
    }

    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return read_config(&local);
    }

    if let Some(home) = dirs::home_dir() {
        let default_path = home.join(".eco").join(CONFIG_FILE);
        if default_path.exists() {
            return read_config(&default_path);
        }
    }

    Ok(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
root = "public"
entry = "index.json"

[runtime]
root_namespace = "app"

[namespace]
base = "/static/"

[namespace.nameSpaces]
ui = "ui.json"
"#,
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.root, PathBuf::from("public"));
        assert_eq!(config.entry.as_deref(), Some("index.json"));
        assert_eq!(config.runtime.root_namespace, "app");
        assert_eq!(config.runtime.stylesheet_poll_interval_ms, 20);
        assert_eq!(config.namespace.namespace_url("ui").as_deref(), Some("/static/ui.json"));
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_config(Some(temp_dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.root, PathBuf::from("."));
        assert!(config.remote.is_none());
        assert!(config.namespace.is_empty());
    }
}
