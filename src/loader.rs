//! Query loader
//!
//! Resolves a query reference into query text:
//! - `kql/<path>` reads a file under the configured query directory
//! - `kql://<path>` fetches `<base url>/<path>`
//! - `https://...` fetches the URL as-is
//! - anything else is inline query text

use crate::cache::MemoCache;
use crate::error::{FleetError, Result};
use crate::paths::clean_path;
use async_trait::async_trait;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait QueryLoader: Send + Sync {
    async fn load(&self, reference: &str) -> Result<String>;
}

/// Treats every reference as inline query text
pub struct InlineLoader;

#[async_trait]
impl QueryLoader for InlineLoader {
    async fn load(&self, reference: &str) -> Result<String> {
        Ok(reference.to_string())
    }
}

pub struct KqlLoader {
    local_dir: PathBuf,
    base_url: Option<String>,
    client: Client,
    cache: Option<(Arc<MemoCache>, Duration)>,
}

impl KqlLoader {
    pub fn new(local_dir: PathBuf, base_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FleetError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            local_dir,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            client,
            cache: None,
        })
    }

    /// Memoize resolved references for `ttl`
    pub fn with_cache(mut self, cache: Arc<MemoCache>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    async fn resolve(&self, reference: &str) -> Result<String> {
        if reference.starts_with("kql/") {
            let path = self.local_dir.join(clean_path(reference));
            debug!("loading kql from {}", path.display());
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| FleetError::Loader(format!("{}: {}", path.display(), e)))?;
            return Ok(text.trim().to_string());
        }

        if let Some(rest) = reference.strip_prefix("kql://") {
            let base_url = self.base_url.as_ref().ok_or_else(|| {
                FleetError::Loader(format!("{} requires KQL_BASEURL to be set", reference))
            })?;
            let url = format!("{}/{}", base_url, clean_path(rest));
            return self.fetch(&url).await;
        }

        if reference.starts_with("https://") {
            return self.fetch(reference).await;
        }

        Ok(reference.to_string())
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        debug!("loading kql from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FleetError::Loader(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Loader(format!("GET {} returned {}", url, status)));
        }
        let text = response
            .text()
            .await
            .map_err(|e| FleetError::Loader(format!("GET {}: {}", url, e)))?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl QueryLoader for KqlLoader {
    async fn load(&self, reference: &str) -> Result<String> {
        match &self.cache {
            Some((cache, ttl)) => {
                let key = MemoCache::key("load_kql", reference)?;
                cache.memoize(&key, *ttl, || self.resolve(reference)).await
            }
            None => self.resolve(reference).await,
        }
    }
}
