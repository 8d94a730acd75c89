use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind tag that selects the fetcher implementation for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Site,
    Channel,
    Other,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Site => "site",
            SourceKind::Channel => "channel",
            SourceKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<SourceKind> {
        match s {
            "site" => Some(SourceKind::Site),
            "channel" => Some(SourceKind::Channel),
            "other" => Some(SourceKind::Other),
            _ => None,
        }
    }
}

/// A configured content origin. Created and edited by the administrative
/// interface; the pipeline only reads it and honors `enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub kind: SourceKind,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(kind: SourceKind, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            url: url.into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

/// A raw entry as produced by a source fetcher, before dedup and filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub source_id: Uuid,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

/// A deduplicated, filtered item ingested from a source. Immutable after
/// creation; `url` is the global dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

/// Lifecycle status of a generated post.
///
/// `NEW` has no variant here: it is the absence of a post row for a content
/// item. Rows are created directly in `Generating` by the atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Generating,
    Generated,
    Approved,
    Sent,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Generating => "generating",
            PostStatus::Generated => "generated",
            PostStatus::Approved => "approved",
            PostStatus::Sent => "sent",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<PostStatus> {
        match s {
            "generating" => Some(PostStatus::Generating),
            "generated" => Some(PostStatus::Generated),
            "approved" => Some(PostStatus::Approved),
            "sent" => Some(PostStatus::Sent),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Sent | PostStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    /// Status only moves forward. `Failed` is reachable from any
    /// non-terminal state, and from `Sent` as the publish compensation:
    /// the claim winner marks `Sent` before transmitting and rolls the
    /// row to `Failed` when transmission never happened.
    pub fn can_advance_to(&self, next: PostStatus) -> bool {
        match next {
            PostStatus::Generating => false,
            PostStatus::Generated => *self == PostStatus::Generating,
            PostStatus::Approved => *self == PostStatus::Generated,
            PostStatus::Sent => *self == PostStatus::Approved,
            PostStatus::Failed => *self != PostStatus::Failed,
        }
    }
}

/// The AI-produced content unit derived from exactly one ContentItem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedPost {
    pub id: Uuid,
    pub item_id: Uuid,
    pub status: PostStatus,
    pub body: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// A topical label; `word` is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub word: String,
    pub created_at: DateTime<Utc>,
}

/// A post joined with everything the publisher needs to format a message.
#[derive(Debug, Clone)]
pub struct PublishablePost {
    pub post: GeneratedPost,
    pub item_title: String,
    pub item_url: String,
    pub tags: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("unusable content: {0}")]
    UnusableContent(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),
}

impl PipelineError {
    /// Transient failures are retried with backoff; everything else is
    /// either benign, permanent, or an infrastructure failure that
    /// propagates to the task queue's own retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Http(_)
                | PipelineError::Generation(_)
                | PipelineError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
