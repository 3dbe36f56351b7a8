//! Fetcher serving URLs from a directory

use super::stylesheet::{count_rules, poll_until_loaded, SheetProbe, SheetState};
use super::{Fetcher, Resource, ResourceKind};
use crate::error::FetchError;
use crate::manifest::ModuleManifest;
use crate::runtime::Runtime;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Maps URL paths onto files below a root directory
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    /// Serve files below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map `url` to a path below the root.
    ///
    /// The query and fragment are dropped and a leading `/` is relative to
    /// the root. Empty, absolute, traversing and NUL-containing references
    /// are rejected.
    pub fn resolve(&self, url: &str) -> Result<PathBuf, FetchError> {
        let invalid = || FetchError::InvalidUrl {
            url: url.to_string(),
        };

        let reference = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
        let reference = reference.trim_start_matches('/');
        if reference.is_empty() {
            return Err(invalid());
        }

        if reference.contains("..") || reference.contains("://") {
            warn!("Rejected resource url with directory traversal or scheme: {}", url);
            return Err(invalid());
        }

        if reference.contains('\0') {
            warn!("Rejected resource url with null byte: {:?}", url);
            return Err(invalid());
        }

        let path = Path::new(reference);
        if path.is_absolute() {
            warn!("Rejected absolute resource url: {}", url);
            return Err(invalid());
        }

        Ok(self.root.join(path))
    }
}

fn read_error(url: &str, path: &Path, error: std::io::Error) -> FetchError {
    if error.kind() == ErrorKind::NotFound {
        FetchError::NotFound {
            url: url.to_string(),
        }
    } else {
        FetchError::Io {
            path: path.to_path_buf(),
            error,
        }
    }
}

struct FileProbe {
    url: String,
    path: PathBuf,
}

#[async_trait]
impl SheetProbe for FileProbe {
    async fn probe(&mut self) -> Result<SheetState, FetchError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(css) => Ok(SheetState::Parsed {
                rules: count_rules(&css),
            }),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(SheetState::SecurityRestricted),
            Err(e) => Err(read_error(&self.url, &self.path, e)),
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, resource: &Resource, runtime: &Runtime) -> Result<(), FetchError> {
        let path = self.resolve(&resource.url)?;
        debug!("Reading {} from {:?}", resource.url, path);

        match resource.kind {
            ResourceKind::Script => {
                let body = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| read_error(&resource.url, &path, e))?;
                ModuleManifest::parse(&resource.url, &body)?.apply(runtime, &resource.url)?;
                Ok(())
            }
            ResourceKind::Stylesheet => {
                let mut probe = FileProbe {
                    url: resource.url.clone(),
                    path,
                };
                let interval = runtime.config().stylesheet_poll_interval();
                poll_until_loaded(&mut probe, interval).await.map(|_| ())
            }
        }
    }
}
