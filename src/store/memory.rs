use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Store;
use crate::types::{
    Candidate, ContentItem, GeneratedPost, PostStatus, PublishablePost, Result, Source, Tag,
};

/// In-memory store used by tests and credential-less local runs.
///
/// A single mutex over all tables gives the same atomicity the Postgres
/// implementation gets from constraints and conditional updates.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sources: HashMap<Uuid, Source>,
    items: HashMap<Uuid, ContentItem>,
    url_index: HashMap<String, Uuid>,
    posts: HashMap<Uuid, GeneratedPost>,
    post_by_item: HashMap<Uuid, Uuid>,
    tags: HashMap<String, Tag>,
    post_tags: HashSet<(Uuid, Uuid)>,
    rate: HashMap<(String, i64), u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_source(&self, source: Source) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sources.insert(source.id, source);
        Ok(())
    }

    async fn list_enabled_sources(&self) -> Result<Vec<Source>> {
        let inner = self.inner.lock().await;
        let mut sources: Vec<Source> = inner
            .sources
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.created_at);
        Ok(sources)
    }

    async fn set_source_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.sources.get_mut(&id) {
            Some(source) => {
                source.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_content_item(&self, candidate: &Candidate) -> Result<Option<ContentItem>> {
        let mut inner = self.inner.lock().await;
        if inner.url_index.contains_key(&candidate.url) {
            return Ok(None);
        }
        let item = ContentItem {
            id: Uuid::new_v4(),
            source_id: candidate.source_id,
            title: candidate.title.clone(),
            url: candidate.url.clone(),
            summary: candidate.summary.clone(),
            published_at: candidate.published_at,
            discovered_at: candidate.discovered_at,
        };
        inner.url_index.insert(item.url.clone(), item.id);
        inner.items.insert(item.id, item.clone());
        Ok(Some(item))
    }

    async fn claim_for_generation(
        &self,
        limit: i64,
    ) -> Result<Vec<(ContentItem, GeneratedPost)>> {
        let mut inner = self.inner.lock().await;

        let mut unclaimed: Vec<ContentItem> = inner
            .items
            .values()
            .filter(|item| !inner.post_by_item.contains_key(&item.id))
            .cloned()
            .collect();
        unclaimed.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then(a.id.cmp(&b.id))
        });
        unclaimed.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(unclaimed.len());
        for item in unclaimed {
            let post = GeneratedPost {
                id: Uuid::new_v4(),
                item_id: item.id,
                status: PostStatus::Generating,
                body: None,
                error_message: None,
                created_at: Utc::now(),
                sent_at: None,
            };
            inner.post_by_item.insert(item.id, post.id);
            inner.posts.insert(post.id, post.clone());
            claimed.push((item, post));
        }
        Ok(claimed)
    }

    async fn complete_generation(&self, post_id: Uuid, body: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.posts.get_mut(&post_id) {
            Some(post) if post.status.can_advance_to(PostStatus::Generated) => {
                post.status = PostStatus::Generated;
                post.body = Some(body.to_string());
                post.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_post(&self, post_id: Uuid, error: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.posts.get_mut(&post_id) {
            Some(post) if !post.status.is_terminal() => {
                post.status = PostStatus::Failed;
                post.error_message = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_stale_generating(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut failed = 0;
        for post in inner.posts.values_mut() {
            if post.status == PostStatus::Generating && post.created_at < cutoff {
                post.status = PostStatus::Failed;
                post.error_message = Some("generation claim expired".to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn approve_post(&self, post_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.posts.get_mut(&post_id) {
            Some(post) if post.status.can_advance_to(PostStatus::Approved) => {
                post.status = PostStatus::Approved;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn approve_generated_posts(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut promoted = 0;
        for post in inner.posts.values_mut() {
            if post.status.can_advance_to(PostStatus::Approved) {
                post.status = PostStatus::Approved;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn posts_needing_tags(&self, limit: i64) -> Result<Vec<GeneratedPost>> {
        let inner = self.inner.lock().await;
        let mut posts: Vec<GeneratedPost> = inner
            .posts
            .values()
            .filter(|p| {
                matches!(p.status, PostStatus::Generated | PostStatus::Approved)
                    && !inner.post_tags.iter().any(|(pid, _)| *pid == p.id)
            })
            .cloned()
            .collect();
        posts.sort_by_key(|p| p.created_at);
        posts.truncate(limit.max(0) as usize);
        Ok(posts)
    }

    async fn attach_tags(&self, post_id: Uuid, words: &[String]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut attached = 0;
        for word in words {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            let tag_id = match inner.tags.get(word) {
                Some(tag) => tag.id,
                None => {
                    let tag = Tag {
                        id: Uuid::new_v4(),
                        word: word.to_string(),
                        created_at: Utc::now(),
                    };
                    let id = tag.id;
                    inner.tags.insert(word.to_string(), tag);
                    id
                }
            };
            if inner.post_tags.insert((post_id, tag_id)) {
                attached += 1;
            }
        }
        Ok(attached)
    }

    async fn tags_for_post(&self, post_id: Uuid) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut words: Vec<String> = inner
            .tags
            .values()
            .filter(|tag| inner.post_tags.contains(&(post_id, tag.id)))
            .map(|tag| tag.word.clone())
            .collect();
        words.sort();
        Ok(words)
    }

    async fn publishable_posts(&self, limit: i64) -> Result<Vec<PublishablePost>> {
        let inner = self.inner.lock().await;
        let mut approved: Vec<GeneratedPost> = inner
            .posts
            .values()
            .filter(|p| p.status == PostStatus::Approved)
            .cloned()
            .collect();
        approved.sort_by_key(|p| p.created_at);
        approved.truncate(limit.max(0) as usize);

        let mut out = Vec::with_capacity(approved.len());
        for post in approved {
            let item = match inner.items.get(&post.item_id) {
                Some(item) => item,
                None => continue,
            };
            let mut tags: Vec<String> = inner
                .tags
                .values()
                .filter(|tag| inner.post_tags.contains(&(post.id, tag.id)))
                .map(|tag| tag.word.clone())
                .collect();
            tags.sort();
            out.push(PublishablePost {
                item_title: item.title.clone(),
                item_url: item.url.clone(),
                tags,
                post,
            });
        }
        Ok(out)
    }

    async fn claim_publish(&self, post_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.posts.get_mut(&post_id) {
            Some(post) if post.status.can_advance_to(PostStatus::Sent) => {
                post.status = PostStatus::Sent;
                post.sent_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_publish_failed(&self, post_id: Uuid, error: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.posts.get_mut(&post_id) {
            Some(post) if post.status == PostStatus::Sent => {
                post.status = PostStatus::Failed;
                post.sent_at = None;
                post.error_message = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_failed_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut doomed: Vec<Uuid> = inner
            .posts
            .values()
            .filter(|p| p.status == PostStatus::Failed && p.created_at < cutoff)
            .map(|p| p.id)
            .collect();
        doomed.sort();
        doomed.truncate(limit.max(0) as usize);

        for id in &doomed {
            if let Some(post) = inner.posts.remove(id) {
                inner.post_by_item.remove(&post.item_id);
            }
            inner.post_tags.retain(|(pid, _)| pid != id);
        }
        Ok(doomed.len() as u64)
    }

    async fn incr_rate_counter(&self, key: &str, window_start: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let count = inner
            .rate
            .entry((key.to_string(), window_start))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn purge_rate_counters_before(&self, cutoff: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.rate.len();
        inner.rate.retain(|(_, window_start), _| *window_start >= cutoff);
        Ok((before - inner.rate.len()) as u64)
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<GeneratedPost>> {
        let inner = self.inner.lock().await;
        Ok(inner.posts.get(&id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
