use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::queue::TaskQueue;
use crate::store::Store;
use crate::types::Result;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub retention_days: i64,
    pub batch: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupStats {
    pub purged_posts: u64,
    pub purged_counters: u64,
    pub purged_tasks: u64,
}

/// Bounds storage growth: purges terminally failed posts past the retention
/// window, rate-counter rows for long-expired windows, and task rows that
/// ran out of attempts. No retry logic of its own; a failed run is simply
/// retried by the next cleanup tick.
pub struct Cleanup {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    config: CleanupConfig,
}

impl Cleanup {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn TaskQueue>, config: CleanupConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub async fn run(&self) -> Result<CleanupStats> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);

        let stats = CleanupStats {
            purged_posts: self
                .store
                .purge_failed_before(cutoff, self.config.batch)
                .await?,
            // Rate windows are far shorter than the retention period, so
            // anything older than the cutoff is long since closed.
            purged_counters: self
                .store
                .purge_rate_counters_before(cutoff.timestamp())
                .await?,
            purged_tasks: self.queue.purge_dead().await?,
        };

        if stats.purged_posts > 0 || stats.purged_counters > 0 || stats.purged_tasks > 0 {
            info!(
                posts = stats.purged_posts,
                counters = stats.purged_counters,
                tasks = stats.purged_tasks,
                "cleanup run finished"
            );
        }
        Ok(stats)
    }
}
