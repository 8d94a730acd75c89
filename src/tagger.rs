use std::sync::Arc;
use tracing::{info, warn};

use crate::llm::TextGenerator;
use crate::store::Store;
use crate::types::Result;

#[derive(Debug, Clone)]
pub struct TaggerConfig {
    pub max_tags: usize,
    pub batch: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TagStats {
    pub examined: usize,
    pub tagged: usize,
}

/// Derives topical tags for generated posts and attaches them.
///
/// Best-effort side channel: a derivation failure is logged and the post
/// moves on toward publication untagged. Attachment is idempotent, so
/// duplicate task deliveries converge on the same join rows.
pub struct Tagger {
    store: Arc<dyn Store>,
    llm: Arc<dyn TextGenerator>,
    config: TaggerConfig,
}

impl Tagger {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn TextGenerator>, config: TaggerConfig) -> Self {
        Self { store, llm, config }
    }

    pub async fn run(&self) -> Result<TagStats> {
        let posts = self.store.posts_needing_tags(self.config.batch).await?;
        let mut stats = TagStats {
            examined: posts.len(),
            ..Default::default()
        };

        for post in posts {
            let Some(body) = post.body.as_deref().filter(|b| !b.trim().is_empty()) else {
                continue;
            };

            let words = match self.llm.keywords(body, self.config.max_tags).await {
                Ok(words) if !words.is_empty() => words,
                Ok(_) => {
                    warn!(post = %post.id, "no tags derived");
                    continue;
                }
                Err(e) => {
                    warn!(post = %post.id, error = %e, "tag derivation failed, will retry next run");
                    continue;
                }
            };

            self.store.attach_tags(post.id, &words).await?;
            stats.tagged += 1;
        }

        if stats.examined > 0 {
            info!(examined = stats.examined, tagged = stats.tagged, "tagging run finished");
        }
        Ok(stats)
    }
}
