use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Store;
use crate::types::{
    Candidate, ContentItem, GeneratedPost, PipelineError, PostStatus, PublishablePost, Result,
    Source, SourceKind,
};

/// Postgres-backed store. All race-sensitive operations lean on the schema:
/// `content_items.url` and `posts.item_id` are unique, status transitions
/// are conditional updates checked by `rows_affected`.
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .map_err(|e| PipelineError::General(format!("migration failed: {}", e)))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }
}

fn row_to_source(row: &PgRow) -> Result<Source> {
    let kind: String = row.try_get("kind")?;
    Ok(Source {
        id: row.try_get("id")?,
        kind: SourceKind::parse(&kind)
            .ok_or_else(|| PipelineError::General(format!("unknown source kind: {}", kind)))?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_item(row: &PgRow) -> Result<ContentItem> {
    Ok(ContentItem {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        summary: row.try_get("summary")?,
        published_at: row.try_get("published_at")?,
        discovered_at: row.try_get("discovered_at")?,
    })
}

fn row_to_post(row: &PgRow) -> Result<GeneratedPost> {
    let status: String = row.try_get("status")?;
    Ok(GeneratedPost {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        status: PostStatus::parse(&status)
            .ok_or_else(|| PipelineError::General(format!("unknown post status: {}", status)))?,
        body: row.try_get("body")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

const POST_COLUMNS: &str = "id, item_id, status, body, error_message, created_at, sent_at";

#[async_trait]
impl Store for PgStore {
    async fn add_source(&self, source: Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, kind, name, url, enabled, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(source.id)
        .bind(source.kind.as_str())
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.enabled)
        .bind(source.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_enabled_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT id, kind, name, url, enabled, created_at FROM sources WHERE enabled = true ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_source).collect()
    }

    async fn set_source_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE sources SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_content_item(&self, candidate: &Candidate) -> Result<Option<ContentItem>> {
        // The unique constraint on url is the authority; losing the race
        // surfaces as zero returned rows, not as an error.
        let row = sqlx::query(
            r#"
            INSERT INTO content_items (id, source_id, title, url, summary, published_at, discovered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (url) DO NOTHING
            RETURNING id, source_id, title, url, summary, published_at, discovered_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(candidate.source_id)
        .bind(&candidate.title)
        .bind(&candidate.url)
        .bind(&candidate.summary)
        .bind(candidate.published_at)
        .bind(candidate.discovered_at)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    async fn claim_for_generation(
        &self,
        limit: i64,
    ) -> Result<Vec<(ContentItem, GeneratedPost)>> {
        // Claim by inserting the post row; the unique constraint on item_id
        // guarantees at-most-one claimant even across overlapping tasks.
        let rows = sqlx::query(&format!(
            r#"
            WITH unclaimed AS (
                SELECT i.id AS claim_item_id
                FROM content_items i
                LEFT JOIN posts p ON p.item_id = i.id
                WHERE p.id IS NULL
                ORDER BY i.discovered_at, i.id
                LIMIT $1
                FOR UPDATE OF i SKIP LOCKED
            )
            INSERT INTO posts (id, item_id, status, created_at)
            SELECT gen_random_uuid(), claim_item_id, 'generating', now()
            FROM unclaimed
            ON CONFLICT (item_id) DO NOTHING
            RETURNING {POST_COLUMNS}
            "#
        ))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let post = row_to_post(row)?;
            let item_row = sqlx::query(
                "SELECT id, source_id, title, url, summary, published_at, discovered_at FROM content_items WHERE id = $1",
            )
            .bind(post.item_id)
            .fetch_one(&self.db)
            .await?;
            claimed.push((row_to_item(&item_row)?, post));
        }
        Ok(claimed)
    }

    async fn complete_generation(&self, post_id: Uuid, body: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'generated', body = $1, error_message = NULL
            WHERE id = $2 AND status = 'generating'
            "#,
        )
        .bind(body)
        .bind(post_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_post(&self, post_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'failed', error_message = $1
            WHERE id = $2 AND status NOT IN ('sent', 'failed')
            "#,
        )
        .bind(error)
        .bind(post_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_stale_generating(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'failed', error_message = 'generation claim expired'
            WHERE status = 'generating' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn approve_post(&self, post_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE posts SET status = 'approved' WHERE id = $1 AND status = 'generated'",
        )
        .bind(post_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn approve_generated_posts(&self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE posts SET status = 'approved' WHERE status = 'generated'")
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected())
    }

    async fn posts_needing_tags(&self, limit: i64) -> Result<Vec<GeneratedPost>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {POST_COLUMNS}
            FROM posts p
            WHERE p.status IN ('generated', 'approved')
              AND NOT EXISTS (SELECT 1 FROM post_tags pt WHERE pt.post_id = p.id)
            ORDER BY p.created_at
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_post).collect()
    }

    async fn attach_tags(&self, post_id: Uuid, words: &[String]) -> Result<usize> {
        let mut attached = 0;
        for word in words {
            let word = word.trim();
            if word.is_empty() {
                continue;
            }
            // Get-or-create the tag; ON CONFLICT makes concurrent first
            // derivations of the same word converge on one row.
            let tag_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO tags (id, word, created_at)
                VALUES ($1, $2, now())
                ON CONFLICT (word) DO UPDATE SET word = EXCLUDED.word
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(word)
            .fetch_one(&self.db)
            .await?;

            let result = sqlx::query(
                r#"
                INSERT INTO post_tags (post_id, tag_id)
                VALUES ($1, $2)
                ON CONFLICT (post_id, tag_id) DO NOTHING
                "#,
            )
            .bind(post_id)
            .bind(tag_id)
            .execute(&self.db)
            .await?;
            attached += result.rows_affected() as usize;
        }
        Ok(attached)
    }

    async fn tags_for_post(&self, post_id: Uuid) -> Result<Vec<String>> {
        let words = sqlx::query_scalar(
            r#"
            SELECT t.word
            FROM tags t
            JOIN post_tags pt ON pt.tag_id = t.id
            WHERE pt.post_id = $1
            ORDER BY t.word
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.db)
        .await?;
        Ok(words)
    }

    async fn publishable_posts(&self, limit: i64) -> Result<Vec<PublishablePost>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.item_id, p.status, p.body, p.error_message, p.created_at, p.sent_at,
                   i.title AS item_title, i.url AS item_url
            FROM posts p
            JOIN content_items i ON i.id = p.item_id
            WHERE p.status = 'approved'
            ORDER BY p.created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let post = row_to_post(row)?;
            let tags = self.tags_for_post(post.id).await?;
            out.push(PublishablePost {
                item_title: row.try_get("item_title")?,
                item_url: row.try_get("item_url")?,
                tags,
                post,
            });
        }
        Ok(out)
    }

    async fn claim_publish(&self, post_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'sent', sent_at = now()
            WHERE id = $1 AND status = 'approved'
            "#,
        )
        .bind(post_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_publish_failed(&self, post_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'failed', sent_at = NULL, error_message = $1
            WHERE id = $2 AND status = 'sent'
            "#,
        )
        .bind(error)
        .bind(post_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_failed_before(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM posts
            WHERE id IN (
                SELECT id FROM posts
                WHERE status = 'failed' AND created_at < $1
                ORDER BY created_at
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    async fn incr_rate_counter(&self, key: &str, window_start: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_counters (key, window_start, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (key, window_start) DO UPDATE SET count = rate_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(&self.db)
        .await?;
        Ok(count as u64)
    }

    async fn purge_rate_counters_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_counters WHERE window_start < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<GeneratedPost>> {
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(row_to_post).transpose()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}
