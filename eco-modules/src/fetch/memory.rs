//! In-process fetcher
//!
//! Serves scripts as Rust closures and stylesheets as strings. Used by
//! embedders that ship their modules in the binary, and by tests that need
//! to count fetches or simulate latency.

use super::stylesheet::{count_rules, poll_until_loaded, SheetProbe, SheetState};
use super::{Fetcher, Resource};
use crate::error::FetchError;
use crate::runtime::Runtime;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A script: registers namespaces and modules on the runtime it is given
pub type ScriptFn = Arc<dyn Fn(&Runtime) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
enum Source {
    Script(ScriptFn),
    Stylesheet {
        /// `None` simulates a sheet whose rules may not be read
        css: Option<String>,
        /// Probes answered with `Pending` before the sheet appears
        pending: usize,
    },
}

#[derive(Default)]
struct MemoryInner {
    sources: RwLock<FxHashMap<String, Source>>,
    counts: Mutex<FxHashMap<String, usize>>,
    latency: RwLock<Option<Duration>>,
}

/// Fetcher backed by an in-memory table
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    inner: Arc<MemoryInner>,
}

impl MemoryFetcher {
    /// Create an empty fetcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `script` at `url`
    pub fn script<F>(self, url: &str, script: F) -> Self
    where
        F: Fn(&Runtime) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(url, Source::Script(Arc::new(script)));
        self
    }

    /// Serve a stylesheet at `url`
    pub fn stylesheet(self, url: &str, css: &str) -> Self {
        self.delayed_stylesheet(url, css, 0)
    }

    /// Serve a stylesheet that only appears after `pending` probes
    pub fn delayed_stylesheet(self, url: &str, css: &str, pending: usize) -> Self {
        self.insert(
            url,
            Source::Stylesheet {
                css: Some(css.to_string()),
                pending,
            },
        );
        self
    }

    /// Serve a stylesheet whose rules refuse to be read
    pub fn cross_origin_stylesheet(self, url: &str) -> Self {
        self.insert(url, Source::Stylesheet { css: None, pending: 0 });
        self
    }

    /// Delay every fetch by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.write() = Some(latency);
        self
    }

    fn insert(&self, url: &str, source: Source) {
        self.inner.sources.write().insert(url.to_string(), source);
    }

    /// How often `url` was fetched
    pub fn fetch_count(&self, url: &str) -> usize {
        self.inner.counts.lock().get(url).copied().unwrap_or(0)
    }

    /// Fetches across every URL
    pub fn total_fetches(&self) -> usize {
        self.inner.counts.lock().values().sum()
    }
}

struct MemoryProbe {
    css: Option<String>,
    pending: usize,
}

#[async_trait]
impl SheetProbe for MemoryProbe {
    async fn probe(&mut self) -> Result<SheetState, FetchError> {
        if self.pending > 0 {
            self.pending -= 1;
            return Ok(SheetState::Pending);
        }
        Ok(match &self.css {
            Some(css) => SheetState::Parsed {
                rules: count_rules(css),
            },
            None => SheetState::SecurityRestricted,
        })
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, resource: &Resource, runtime: &Runtime) -> Result<(), FetchError> {
        *self
            .inner
            .counts
            .lock()
            .entry(resource.url.clone())
            .or_insert(0) += 1;

        let latency = *self.inner.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let source = self.inner.sources.read().get(&resource.url).cloned();
        match source {
            None => Err(FetchError::NotFound {
                url: resource.url.clone(),
            }),
            Some(Source::Script(script)) => {
                trace!("Running in-memory script {}", resource.url);
                script(runtime).map_err(|e| FetchError::Script {
                    url: resource.url.clone(),
                    message: format!("{:#}", e),
                })
            }
            Some(Source::Stylesheet { css, pending }) => {
                let mut probe = MemoryProbe { css, pending };
                let interval = runtime.config().stylesheet_poll_interval();
                poll_until_loaded(&mut probe, interval).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ResourceKind;
    use crate::module::Factory;

    #[tokio::test]
    async fn test_script_registers_modules() {
        let fetcher = MemoryFetcher::new().script("/lib.js", |runtime| {
            runtime.root().define("lib", &[], Factory::value(1_u8))?;
            Ok(())
        });
        let runtime = Runtime::new(fetcher.clone());

        fetcher
            .fetch(&Resource::new("/lib.js"), &runtime)
            .await
            .unwrap();
        assert!(runtime.root().module("lib").is_some());
        assert_eq!(fetcher.fetch_count("/lib.js"), 1);
    }

    #[tokio::test]
    async fn test_missing_and_failing_sources() {
        let fetcher = MemoryFetcher::new().script("/bad.js", |_| anyhow::bail!("boom"));
        let runtime = Runtime::new(fetcher.clone());

        let missing = fetcher.fetch(&Resource::new("/none.js"), &runtime).await;
        assert!(matches!(missing, Err(FetchError::NotFound { .. })));

        let failing = fetcher.fetch(&Resource::new("/bad.js"), &runtime).await;
        assert!(matches!(failing, Err(FetchError::Script { ref message, .. }) if message == "boom"));
        assert_eq!(fetcher.total_fetches(), 2);
    }

    #[tokio::test]
    async fn test_stylesheets_load() {
        let fetcher = MemoryFetcher::new()
            .delayed_stylesheet("/a.css", "a { }", 2)
            .cross_origin_stylesheet("/b.css");
        let runtime = Runtime::new(fetcher.clone());

        let sheet = Resource::new("/a.css");
        assert_eq!(sheet.kind, ResourceKind::Stylesheet);
        assert!(fetcher.fetch(&sheet, &runtime).await.is_ok());
        assert!(fetcher.fetch(&Resource::new("/b.css"), &runtime).await.is_ok());
    }
}
