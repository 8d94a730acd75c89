use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::llm::TextGenerator;
use crate::store::Store;
use crate::types::{ContentItem, PipelineError, Result};

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub prompt_template: String,
    pub min_generated_len: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub batch: i64,
    /// How long a claim may sit in `Generating` before it counts as
    /// abandoned by a dead worker.
    pub claim_timeout: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GenerateStats {
    pub claimed: usize,
    pub generated: usize,
    pub failed: usize,
    pub reaped: u64,
}

/// Drives items through `NEW -> GENERATING -> GENERATED | FAILED`.
///
/// Claiming happens in the store by creating the post row, so overlapping
/// task deliveries each get a disjoint set of items.
pub struct Generator {
    store: Arc<dyn Store>,
    llm: Arc<dyn TextGenerator>,
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn TextGenerator>, config: GeneratorConfig) -> Self {
        Self { store, llm, config }
    }

    pub async fn run(&self) -> Result<GenerateStats> {
        // A worker that died after claiming leaves rows stuck in
        // `Generating`; nothing else ever touches them, so each run fails
        // the ones past the claim timeout before claiming its own batch.
        let stale_cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.claim_timeout.as_secs() as i64);
        let reaped = self.store.fail_stale_generating(stale_cutoff).await?;
        if reaped > 0 {
            warn!(reaped, "failed abandoned generation claims");
        }

        let claimed = self.store.claim_for_generation(self.config.batch).await?;
        let mut stats = GenerateStats {
            claimed: claimed.len(),
            reaped,
            ..Default::default()
        };

        for (item, post) in claimed {
            match self.generate_one(&item).await {
                Ok(text) => {
                    self.store.complete_generation(post.id, &text).await?;
                    stats.generated += 1;
                }
                Err(e) => {
                    warn!(item = %item.url, error = %e, "generation failed");
                    self.store.fail_post(post.id, &e.to_string()).await?;
                    stats.failed += 1;
                }
            }
        }

        if stats.claimed > 0 {
            info!(
                claimed = stats.claimed,
                generated = stats.generated,
                failed = stats.failed,
                "generation run finished"
            );
        }
        Ok(stats)
    }

    async fn generate_one(&self, item: &ContentItem) -> Result<String> {
        let content = format!("{}\n\n{}", item.title, item.summary);
        if content.trim().is_empty() {
            return Err(PipelineError::UnusableContent("item has no text".to_string()));
        }

        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.config.retry_base_delay,
            initial_interval: self.config.retry_base_delay,
            max_interval: self.config.retry_base_delay * 16,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            match self.llm.generate(&self.config.prompt_template, &content).await {
                Ok(text) => {
                    let text = text.trim();
                    // Character count, not bytes: multi-byte scripts must
                    // not slip past the minimum.
                    if text.chars().count() < self.config.min_generated_len {
                        // Short or empty output will not improve on retry.
                        return Err(PipelineError::UnusableContent(
                            "generated text too short".to_string(),
                        ));
                    }
                    return Ok(text.to_string());
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.retry_base_delay);
                    warn!(item = %item.url, attempt = attempt + 1, error = %e, "retrying generation in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| PipelineError::Generation("retries exhausted".to_string())))
    }
}
