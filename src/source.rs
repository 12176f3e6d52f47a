//! Source text retrieval for the scanner.
//!
//! The scanner only needs `fetch(locator) -> text`; how the text is obtained
//! is up to the [`SourceFetcher`] implementation.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::debug;

use crate::types::SourceLocator;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &SourceLocator) -> Result<String>;
}

/// Fetches `http(s)://` locators over HTTP and everything else from disk.
pub struct DefaultSourceFetcher {
    client: Client,
}

impl DefaultSourceFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("eserver-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn http_url(locator: &SourceLocator) -> Option<url::Url> {
    let parsed = url::Url::parse(locator.as_str()).ok()?;
    matches!(parsed.scheme(), "http" | "https").then_some(parsed)
}

#[async_trait]
impl SourceFetcher for DefaultSourceFetcher {
    async fn fetch(&self, locator: &SourceLocator) -> Result<String> {
        if let Some(url) = http_url(locator) {
            debug!("Fetching source over HTTP: {}", url);
            let text = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;
            return Ok(text);
        }

        debug!("Reading source from disk: {}", locator);
        tokio::fs::read_to_string(locator.as_str())
            .await
            .with_context(|| format!("failed to read `{}`", locator))
    }
}

/// Serves sources held in memory. Unknown locators fail like a missing file.
#[derive(Default)]
pub struct StaticSourceFetcher {
    sources: RwLock<HashMap<SourceLocator, String>>,
}

impl StaticSourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, locator: impl Into<SourceLocator>, text: impl Into<String>) -> Self {
        self.set(locator, text);
        self
    }

    /// Replace the text for a locator, e.g. after the source changed.
    pub fn set(&self, locator: impl Into<SourceLocator>, text: impl Into<String>) {
        self.sources.write().insert(locator.into(), text.into());
    }
}

#[async_trait]
impl SourceFetcher for StaticSourceFetcher {
    async fn fetch(&self, locator: &SourceLocator) -> Result<String> {
        self.sources
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no source registered for `{}`", locator))
    }
}
