//! Fetcher for remote URLs

use super::{Fetcher, Resource, ResourceKind};
use crate::error::FetchError;
use crate::manifest::ModuleManifest;
use crate::runtime::Runtime;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Loads scripts and stylesheets over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Fetcher with a default client
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetcher sharing an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// 401 and 403 mean the sheet exists but may not be read
fn is_security_refusal(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, resource: &Resource, runtime: &Runtime) -> Result<(), FetchError> {
        let http_error = |error| FetchError::Http {
            url: resource.url.clone(),
            error,
        };

        debug!("GET {}", resource.url);
        let response = self
            .client
            .get(&resource.url)
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();

        match resource.kind {
            ResourceKind::Stylesheet if status.is_success() => Ok(()),
            ResourceKind::Stylesheet if is_security_refusal(status) => {
                warn!("Stylesheet {} refused with {}; treating as loaded", resource.url, status);
                Ok(())
            }
            _ if status == StatusCode::NOT_FOUND => Err(FetchError::NotFound {
                url: resource.url.clone(),
            }),
            _ if !status.is_success() => Err(FetchError::Status {
                url: resource.url.clone(),
                status: status.as_u16(),
            }),
            ResourceKind::Stylesheet => Ok(()),
            ResourceKind::Script => {
                let body = response.text().await.map_err(http_error)?;
                ModuleManifest::parse(&resource.url, &body)?.apply(runtime, &resource.url)?;
                Ok(())
            }
        }
    }
}
