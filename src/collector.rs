use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::filter::KeywordFilter;
use crate::limiter::RateLimiter;
use crate::sources::FetcherRegistry;
use crate::store::Store;
use crate::types::{Candidate, PipelineError, Result, Source};

#[derive(Debug, Default, Clone, Copy)]
pub struct CollectStats {
    pub sources: usize,
    pub failed_sources: usize,
    pub fetched: usize,
    pub accepted: usize,
}

/// Fetches raw entries from every enabled source, normalizes them, and runs
/// them through the keyword filter and the dedup insert. Holds no state of
/// its own; reruns over an unchanged source create nothing new.
pub struct Collector {
    store: Arc<dyn Store>,
    registry: Arc<FetcherRegistry>,
    limiter: RateLimiter,
    filter: KeywordFilter,
}

impl Collector {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<FetcherRegistry>,
        limiter: RateLimiter,
        filter: KeywordFilter,
    ) -> Self {
        Self {
            store,
            registry,
            limiter,
            filter,
        }
    }

    pub async fn run(&self) -> Result<CollectStats> {
        let sources = self.store.list_enabled_sources().await?;
        let mut stats = CollectStats {
            sources: sources.len(),
            ..Default::default()
        };

        for source in &sources {
            // One unreachable source never aborts the rest of the run.
            match self.collect_source(source).await {
                Ok((fetched, accepted)) => {
                    stats.fetched += fetched;
                    stats.accepted += accepted;
                }
                Err(e) => {
                    stats.failed_sources += 1;
                    warn!(source = %source.name, error = %e, "source collection failed, skipping");
                }
            }
        }

        info!(
            sources = stats.sources,
            failed = stats.failed_sources,
            fetched = stats.fetched,
            accepted = stats.accepted,
            "collection run finished"
        );
        Ok(stats)
    }

    async fn collect_source(&self, source: &Source) -> Result<(usize, usize)> {
        let fetcher = self.registry.get(source.kind).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "no fetcher registered for source kind {}",
                source.kind.as_str()
            ))
        })?;

        self.limiter
            .acquire_blocking(&source.id.to_string())
            .await?;

        let entries = fetcher.fetch(source).await?;
        let fetched = entries.len();
        let mut accepted = 0;

        for entry in entries {
            if url::Url::parse(&entry.url).is_err() {
                warn!(source = %source.name, url = %entry.url, "entry has an unusable url, skipping");
                continue;
            }
            if !self.filter.matches(&entry.title, &entry.summary) {
                continue;
            }
            let candidate = Candidate {
                source_id: source.id,
                title: entry.title,
                url: entry.url,
                summary: entry.summary,
                published_at: entry.published_at,
                discovered_at: Utc::now(),
            };
            // None means the URL is already known; losing a concurrent
            // insert race lands here too and is just as fine.
            if self.store.insert_content_item(&candidate).await?.is_some() {
                accepted += 1;
            }
        }

        Ok((fetched, accepted))
    }
}
