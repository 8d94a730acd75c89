pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{Candidate, ContentItem, GeneratedPost, PublishablePost, Result, Source};

/// Persistence seam for the pipeline.
///
/// The store is the single arbiter of cross-worker races: the unique URL
/// constraint makes ingestion idempotent, the unique post-per-item
/// constraint makes the generation claim exclusive, and the conditional
/// status updates make publication at-most-once under at-least-once task
/// delivery.
#[async_trait]
pub trait Store: Send + Sync {
    // -- sources (written by the administrative interface) --
    async fn add_source(&self, source: Source) -> Result<()>;
    async fn list_enabled_sources(&self) -> Result<Vec<Source>>;
    async fn set_source_enabled(&self, id: Uuid, enabled: bool) -> Result<bool>;

    // -- ingestion --

    /// Persist a candidate unless an item with the same URL already exists.
    /// Returns `None` on a duplicate; losing the insert race is benign.
    async fn insert_content_item(&self, candidate: &Candidate) -> Result<Option<ContentItem>>;

    // -- generation state machine --

    /// Atomically claim up to `limit` items that have no post yet by
    /// creating their post rows in `Generating`. Two concurrent callers
    /// never claim the same item.
    async fn claim_for_generation(&self, limit: i64)
        -> Result<Vec<(ContentItem, GeneratedPost)>>;

    /// `Generating` -> `Generated` with the produced text. Returns false if
    /// the row was not in `Generating`.
    async fn complete_generation(&self, post_id: Uuid, body: &str) -> Result<bool>;

    /// Any non-terminal status -> `Failed`.
    async fn fail_post(&self, post_id: Uuid, error: &str) -> Result<bool>;

    /// Fail `Generating` posts claimed before `cutoff`. A worker that dies
    /// after claiming leaves such rows behind; without this they would
    /// never advance, because the claim only sees items with no post row.
    async fn fail_stale_generating(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // -- approval --

    /// Manual approval hook: `Generated` -> `Approved`.
    async fn approve_post(&self, post_id: Uuid) -> Result<bool>;

    /// Automatic approval policy: promote every `Generated` post.
    async fn approve_generated_posts(&self) -> Result<u64>;

    // -- tagging --

    /// Posts in `Generated` or `Approved` that have no tags attached yet.
    async fn posts_needing_tags(&self, limit: i64) -> Result<Vec<GeneratedPost>>;

    /// Get-or-create each tag word and attach it to the post, skipping
    /// attachments that already exist. Returns the number of new links.
    async fn attach_tags(&self, post_id: Uuid, words: &[String]) -> Result<usize>;

    async fn tags_for_post(&self, post_id: Uuid) -> Result<Vec<String>>;

    // -- publication --

    /// Posts in `Approved`, joined with item and tags for formatting.
    async fn publishable_posts(&self, limit: i64) -> Result<Vec<PublishablePost>>;

    /// Conditional `Approved` -> `Sent` claim. Exactly one concurrent caller
    /// observes true; the loser treats false as already-published.
    async fn claim_publish(&self, post_id: Uuid) -> Result<bool>;

    /// Compensate a claimed-but-untransmitted post: `Sent` -> `Failed` and
    /// clear the sent time. Only the claim winner calls this.
    async fn mark_publish_failed(&self, post_id: Uuid, error: &str) -> Result<bool>;

    // -- cleanup --

    /// Delete `Failed` posts created before `cutoff`, at most `limit` rows.
    async fn purge_failed_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;

    // -- shared counters --

    /// Atomic increment-and-get for the rate limiter window counter.
    async fn incr_rate_counter(&self, key: &str, window_start: i64) -> Result<u64>;

    /// Delete rate counters for windows that started before `cutoff`
    /// (unix seconds). Counters are write-once per window, so old rows
    /// only take up space.
    async fn purge_rate_counters_before(&self, cutoff: i64) -> Result<u64>;

    // -- inspection / probes --
    async fn get_post(&self, id: Uuid) -> Result<Option<GeneratedPost>>;
    async fn ping(&self) -> Result<()>;
}
