//! Runtime construction for CLI commands

use crate::config::Config;
use anyhow::{Context, Result};
use eco_modules::{FileFetcher, Fetcher, HttpFetcher, NamespaceConfig, Resource, Runtime};
use std::sync::Arc;
use tracing::{debug, info};

/// Build the runtime described by `config` and apply its entry manifest
pub async fn start(config: &Config) -> Result<Runtime> {
    let fetcher: Arc<dyn Fetcher> = match &config.remote {
        Some(remote) => {
            info!("Serving modules from {}", remote);
            Arc::new(HttpFetcher::new())
        }
        None => {
            debug!("Serving modules from {}", config.root.display());
            Arc::new(FileFetcher::new(&config.root))
        }
    };

    let runtime = Runtime::with_config(config.runtime.clone(), fetcher);
    runtime.root().config(root_config(config));

    if let Some(entry) = &config.entry {
        let url = entry_url(config, entry);
        runtime
            .fetcher()
            .fetch(&Resource::new(url.clone()), &runtime)
            .await
            .with_context(|| format!("Failed to load entry manifest {}", url))?;
    }

    Ok(runtime)
}

/// Root namespace table; a remote base is used when none is configured
fn root_config(config: &Config) -> NamespaceConfig {
    let mut table = config.namespace.clone();
    if table.base.is_none() {
        if let Some(remote) = &config.remote {
            table.base = Some(with_trailing_slash(remote));
        }
    }
    table
}

fn entry_url(config: &Config, entry: &str) -> String {
    match &config.remote {
        Some(remote) if !entry.contains("://") => {
            format!("{}{}", with_trailing_slash(remote), entry.trim_start_matches('/'))
        }
        _ => entry.to_string(),
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}
