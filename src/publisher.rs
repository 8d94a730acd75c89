use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::store::Store;
use crate::transport::Transport;
use crate::types::{PipelineError, PublishablePost, Result};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub auto_approve: bool,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub batch: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PublishStats {
    pub approved: u64,
    pub sent: usize,
    pub failed: usize,
    pub lost_claims: usize,
}

/// Continues the state machine `GENERATED -> APPROVED -> SENT`.
///
/// The store's conditional update is the publication claim: the winner
/// transmits, a concurrent duplicate delivery loses the claim and treats
/// the post as already published. A claimed post whose transmission fails
/// past the retry budget is compensated to `FAILED`.
pub struct Publisher {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub async fn run(&self) -> Result<PublishStats> {
        let mut stats = PublishStats::default();

        if self.config.auto_approve {
            stats.approved = self.store.approve_generated_posts().await?;
        }

        let posts = self.store.publishable_posts(self.config.batch).await?;
        for post in posts {
            if !self.store.claim_publish(post.post.id).await? {
                // Another worker won the claim; benign.
                stats.lost_claims += 1;
                continue;
            }

            let message = format_message(&post);
            match self.transmit(&message).await {
                Ok(()) => {
                    info!(post = %post.post.id, "published");
                    stats.sent += 1;
                }
                Err(e) => {
                    warn!(post = %post.post.id, error = %e, "publication failed");
                    self.store
                        .mark_publish_failed(post.post.id, &e.to_string())
                        .await?;
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn transmit(&self, message: &str) -> Result<()> {
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
            match self.transport.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.retry_base_delay);
                    warn!(attempt = attempt + 1, error = %e, "retrying publication in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| PipelineError::Transport("retries exhausted".to_string())))
    }
}

/// Render the channel message: body, hashtag markers, source link.
pub fn format_message(post: &PublishablePost) -> String {
    let mut message = post
        .post
        .body
        .clone()
        .unwrap_or_else(|| post.item_title.clone());

    if !post.tags.is_empty() {
        let tags: Vec<String> = post
            .tags
            .iter()
            .map(|w| format!("#{}", w.replace(' ', "_")))
            .collect();
        message.push_str("\n\n");
        message.push_str(&tags.join(" "));
    }

    message.push_str(&format!("\n\n[source]({})", post.item_url));
    message
}
