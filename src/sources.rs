use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::types::{PipelineError, Result, Source, SourceKind};

/// A raw entry as pulled from a source, before normalization into a
/// candidate.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub title: String,
    pub url: String,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Source-kind-specific fetch capability. One implementation per kind;
/// the registry dispatches on the source's kind tag.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, source: &Source) -> Result<Vec<RawEntry>>;
}

/// Registry of fetchers keyed by source kind.
pub struct FetcherRegistry {
    fetchers: HashMap<SourceKind, Box<dyn SourceFetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self {
            fetchers: HashMap::new(),
        }
    }

    pub fn register(&mut self, fetcher: Box<dyn SourceFetcher>) {
        self.fetchers.insert(fetcher.kind(), fetcher);
    }

    pub fn get(&self, kind: SourceKind) -> Option<&dyn SourceFetcher> {
        self.fetchers.get(&kind).map(|f| f.as_ref())
    }
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetcher for `Site` sources exposing an RSS/Atom feed.
pub struct FeedFetcher {
    client: reqwest::Client,
}

impl FeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("newsloom/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for FeedFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Site
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<RawEntry>> {
        debug!(source = %source.name, url = %source.url, "fetching feed");

        let feed_url = url::Url::parse(&source.url)?;
        let response = self.client.get(feed_url.as_str()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Parse(format!(
                "HTTP {} from {}",
                status, source.url
            )));
        }
        let body = response.text().await?;

        let feed = parser::parse(body.as_bytes())
            .map_err(|e| PipelineError::Parse(format!("failed to parse feed: {}", e)))?;

        let mut entries = Vec::with_capacity(feed.entries.len());
        for entry in feed.entries {
            let Some(link) = entry.links.first() else {
                continue;
            };
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();

            entries.push(RawEntry {
                title,
                url: link.href.clone(),
                summary,
                published_at: entry.published.map(|dt| dt.with_timezone(&Utc)),
            });
        }

        debug!(source = %source.name, count = entries.len(), "fetched entries");
        Ok(entries)
    }
}
