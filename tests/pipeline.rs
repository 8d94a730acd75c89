use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use newsloom::cleanup::{Cleanup, CleanupConfig};
use newsloom::collector::Collector;
use newsloom::config::Settings;
use newsloom::filter::KeywordFilter;
use newsloom::generator::{Generator, GeneratorConfig};
use newsloom::limiter::{Decision, RateLimiter};
use newsloom::llm::{MockGenerator, TextGenerator};
use newsloom::pipeline::Pipeline;
use newsloom::publisher::{Publisher, PublisherConfig};
use newsloom::queue::{MemoryQueue, StageTask, TaskQueue};
use newsloom::sources::{FetcherRegistry, RawEntry, SourceFetcher};
use newsloom::store::{MemoryStore, Store};
use newsloom::transport::Transport;
use newsloom::types::{PipelineError, PostStatus, Result, Source, SourceKind};
use newsloom::worker::{Worker, WorkerConfig};

/// Fetcher that replays a fixed set of entries on every call.
struct ScriptedFetcher {
    entries: Vec<RawEntry>,
}

impl ScriptedFetcher {
    fn new(entries: Vec<RawEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Site
    }

    async fn fetch(&self, _source: &Source) -> Result<Vec<RawEntry>> {
        Ok(self.entries.clone())
    }
}

/// Transport that records every message it is asked to send.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &str) -> Result<()> {
        self.sent.lock().await.push(message.to_string());
        Ok(())
    }
}

/// Transport that fails every attempt with a transient error.
#[derive(Default)]
struct BrokenTransport {
    attempts: AtomicUsize,
}

#[async_trait]
impl Transport for BrokenTransport {
    async fn send(&self, _message: &str) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Transport("connection refused".to_string()))
    }
}

/// Generator that fails every attempt with a transient error.
#[derive(Default)]
struct BrokenGenerator {
    attempts: AtomicUsize,
}

#[async_trait]
impl TextGenerator for BrokenGenerator {
    async fn generate(&self, _prompt: &str, _content: &str) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Generation("model unavailable".to_string()))
    }

    async fn keywords(&self, _text: &str, _max: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

/// Generator that always returns the same canned text.
struct CannedGenerator {
    text: String,
    attempts: AtomicUsize,
}

impl CannedGenerator {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(&self, _prompt: &str, _content: &str) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }

    async fn keywords(&self, _text: &str, _max: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

fn generator_config() -> GeneratorConfig {
    GeneratorConfig {
        prompt_template: "Write a short post:".to_string(),
        min_generated_len: 20,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(1),
        batch: 5,
        claim_timeout: Duration::from_secs(600),
    }
}

fn entry(title: &str, url: &str, summary: &str) -> RawEntry {
    RawEntry {
        title: title.to_string(),
        url: url.to_string(),
        summary: summary.to_string(),
        published_at: None,
    }
}

fn test_settings() -> Settings {
    Settings {
        retry_base_delay: Duration::from_millis(1),
        ..Settings::default()
    }
}

fn registry_with(entries: Vec<RawEntry>) -> Arc<FetcherRegistry> {
    let mut registry = FetcherRegistry::new();
    registry.register(Box::new(ScriptedFetcher::new(entries)));
    Arc::new(registry)
}

async fn seeded_store() -> (Arc<MemoryStore>, Source) {
    let store = Arc::new(MemoryStore::new());
    let source = Source::new(SourceKind::Site, "example", "https://feed.example/rss");
    store.add_source(source.clone()).await.unwrap();
    (store, source)
}

#[tokio::test]
async fn collector_rerun_over_unchanged_source_creates_nothing() {
    let (store, _source) = seeded_store().await;
    let registry = registry_with(vec![entry(
        "Rust 2.0 announced",
        "https://x/1",
        "Release notes for the new edition.",
    )]);
    let settings = test_settings();
    let limiter = RateLimiter::new(
        store.clone(),
        settings.rate_limit_per_window,
        settings.rate_limit_window,
    );
    let collector = Collector::new(
        store.clone(),
        registry,
        limiter,
        KeywordFilter::accept_all(),
    );

    let first = collector.run().await.unwrap();
    let second = collector.run().await.unwrap();

    assert_eq!(first.accepted, 1);
    assert_eq!(second.accepted, 0);
    // Only the one item exists, claimable exactly once.
    assert_eq!(store.claim_for_generation(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn collector_drops_entries_without_matching_keywords() {
    let (store, _source) = seeded_store().await;
    let registry = registry_with(vec![
        entry("Gardening tips", "https://x/flowers", "Plant tulips in fall."),
        entry("Rust release", "https://x/rust", "New compiler features."),
    ]);
    let settings = test_settings();
    let limiter = RateLimiter::new(
        store.clone(),
        settings.rate_limit_per_window,
        settings.rate_limit_window,
    );
    let collector = Collector::new(
        store.clone(),
        registry,
        limiter,
        KeywordFilter::new(vec!["rust".to_string()]),
    );

    let stats = collector.run().await.unwrap();

    assert_eq!(stats.fetched, 2);
    assert_eq!(stats.accepted, 1);
    let claimed = store.claim_for_generation(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].0.url, "https://x/rust");
}

#[tokio::test]
async fn generated_post_is_not_published_before_approval() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let (_, post) = store.claim_for_generation(1).await.unwrap().remove(0);
    store
        .complete_generation(post.id, "A perfectly fine generated body.")
        .await
        .unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let publisher = Publisher::new(
        store.clone(),
        transport.clone(),
        PublisherConfig {
            auto_approve: false,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            batch: 10,
        },
    );

    let stats = publisher.run().await.unwrap();

    assert_eq!(stats.sent, 0);
    assert!(transport.sent().await.is_empty());
    let unchanged = store.get_post(post.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, PostStatus::Generated);
}

#[tokio::test]
async fn exhausted_publish_retries_fail_the_post_and_cleanup_purges_it() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let (_, post) = store.claim_for_generation(1).await.unwrap().remove(0);
    store
        .complete_generation(post.id, "A perfectly fine generated body.")
        .await
        .unwrap();
    store.approve_post(post.id).await.unwrap();

    let transport = Arc::new(BrokenTransport::default());
    let publisher = Publisher::new(
        store.clone(),
        transport.clone(),
        PublisherConfig {
            auto_approve: false,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            batch: 10,
        },
    );

    let stats = publisher.run().await.unwrap();
    assert_eq!(stats.failed, 1);
    // 1 initial attempt + 3 retries.
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 4);
    let failed = store.get_post(post.id).await.unwrap().unwrap();
    assert_eq!(failed.status, PostStatus::Failed);
    assert!(failed.sent_at.is_none());

    // Past the retention window, cleanup deletes the failed post.
    let cleanup = Cleanup::new(
        store.clone(),
        Arc::new(MemoryQueue::new()),
        CleanupConfig {
            retention_days: 0,
            batch: 10,
        },
    );
    assert_eq!(cleanup.run().await.unwrap().purged_posts, 1);
    assert!(store.get_post(post.id).await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_generation_retries_fail_the_post() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let llm = Arc::new(BrokenGenerator::default());
    let generator = Generator::new(store.clone(), llm.clone(), generator_config());

    let stats = generator.run().await.unwrap();

    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.failed, 1);
    // 1 initial attempt + 3 retries.
    assert_eq!(llm.attempts.load(Ordering::SeqCst), 4);
    // The failed post keeps its claim: nothing left to generate or tag.
    assert!(store.claim_for_generation(10).await.unwrap().is_empty());
    assert!(store.posts_needing_tags(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn abandoned_generation_claim_is_failed_by_the_next_run() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    // Claim the item and never complete it, as a worker dying mid-batch
    // would.
    let (_, post) = store.claim_for_generation(1).await.unwrap().remove(0);

    // With the claim timeout intact the row just sits there.
    let generator = Generator::new(
        store.clone(),
        Arc::new(MockGenerator),
        generator_config(),
    );
    let stats = generator.run().await.unwrap();
    assert_eq!(stats.reaped, 0);
    assert_eq!(
        store.get_post(post.id).await.unwrap().unwrap().status,
        PostStatus::Generating
    );

    // Once the claim is older than the timeout, the next run fails it.
    let impatient = Generator::new(
        store.clone(),
        Arc::new(MockGenerator),
        GeneratorConfig {
            claim_timeout: Duration::from_secs(0),
            ..generator_config()
        },
    );
    let stats = impatient.run().await.unwrap();
    assert_eq!(stats.reaped, 1);
    let failed = store.get_post(post.id).await.unwrap().unwrap();
    assert_eq!(failed.status, PostStatus::Failed);
}

#[tokio::test]
async fn minimum_length_counts_characters_not_bytes() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    // 19 characters but well over 20 bytes of UTF-8.
    let llm = Arc::new(CannedGenerator::new("Краткая новость дня"));
    let generator = Generator::new(store.clone(), llm.clone(), generator_config());

    let stats = generator.run().await.unwrap();

    assert_eq!(stats.failed, 1);
    // Too-short output is a permanent content failure, never retried.
    assert_eq!(llm.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_purges_expired_counters_and_dead_tasks() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());

    // An ancient rate window and a task that exhausted its attempts.
    store.incr_rate_counter("source-1", 0).await.unwrap();
    queue.enqueue(StageTask::Generate).await.unwrap();
    loop {
        let claimed = queue.claim("w1", 1).await.unwrap();
        if claimed.is_empty() {
            break;
        }
        queue.nack(claimed[0].id, "boom").await.unwrap();
    }

    let cleanup = Cleanup::new(
        store.clone(),
        queue.clone(),
        CleanupConfig {
            retention_days: 0,
            batch: 10,
        },
    );
    let stats = cleanup.run().await.unwrap();

    assert_eq!(stats.purged_counters, 1);
    assert_eq!(stats.purged_tasks, 1);
    // The purged window starts counting from scratch.
    assert_eq!(store.incr_rate_counter("source-1", 0).await.unwrap(), 1);
}

#[tokio::test]
async fn worker_drives_an_item_from_feed_to_channel() {
    let (store, _source) = seeded_store().await;
    let registry = registry_with(vec![entry(
        "Rust 2.0 announced today",
        "https://x/1",
        "The release brings many improvements.",
    )]);
    let transport = Arc::new(RecordingTransport::default());
    let settings = test_settings();

    let queue = Arc::new(MemoryQueue::new());
    let pipeline = Arc::new(Pipeline::new(
        &settings,
        store.clone() as Arc<dyn Store>,
        queue.clone(),
        registry,
        Arc::new(MockGenerator),
        transport.clone(),
    ));
    let worker = Worker::new(
        queue.clone(),
        pipeline,
        WorkerConfig {
            id: "w1".to_string(),
            batch: 10,
            poll_interval: Duration::from_millis(1),
        },
    );

    for task in StageTask::ALL {
        queue.enqueue(task).await.unwrap();
    }
    let claimed = worker.drain().await.unwrap();
    assert_eq!(claimed, StageTask::ALL.len());

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("Rust 2.0 announced today"));
    assert!(sent[0].contains("[source](https://x/1)"));
    assert_eq!(queue.pending().await.unwrap(), 0);

    // A full rerun of every stage changes nothing and sends nothing more.
    for task in StageTask::ALL {
        queue.enqueue(task).await.unwrap();
    }
    worker.drain().await.unwrap();
    assert_eq!(transport.sent().await.len(), 1);
}

#[tokio::test]
async fn duplicate_publish_tasks_transmit_once() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let (_, post) = store.claim_for_generation(1).await.unwrap().remove(0);
    store
        .complete_generation(post.id, "A perfectly fine generated body.")
        .await
        .unwrap();
    store.approve_post(post.id).await.unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let registry = registry_with(Vec::new());
    let settings = test_settings();
    let queue = Arc::new(MemoryQueue::new());
    let pipeline = Arc::new(Pipeline::new(
        &settings,
        store.clone() as Arc<dyn Store>,
        queue.clone(),
        registry,
        Arc::new(MockGenerator),
        transport.clone(),
    ));
    let worker = Worker::new(
        queue.clone(),
        pipeline,
        WorkerConfig {
            id: "w1".to_string(),
            batch: 10,
            poll_interval: Duration::from_millis(1),
        },
    );

    queue.enqueue(StageTask::Publish).await.unwrap();
    queue.enqueue(StageTask::Publish).await.unwrap();
    worker.drain().await.unwrap();

    assert_eq!(transport.sent().await.len(), 1);
    let sent = store.get_post(post.id).await.unwrap().unwrap();
    assert_eq!(sent.status, PostStatus::Sent);
    assert!(sent.sent_at.is_some());
}

#[tokio::test]
async fn concurrent_publish_claims_have_exactly_one_winner() {
    let (store, source) = seeded_store().await;
    store
        .insert_content_item(&newsloom::types::Candidate {
            source_id: source.id,
            title: "Big story".to_string(),
            url: "https://x/1".to_string(),
            summary: "Details".to_string(),
            published_at: None,
            discovered_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    let (_, post) = store.claim_for_generation(1).await.unwrap().remove(0);
    store
        .complete_generation(post.id, "A perfectly fine generated body.")
        .await
        .unwrap();
    store.approve_post(post.id).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_publish(post.id).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn rate_limiter_grants_at_most_the_limit_under_contention() {
    let store = Arc::new(MemoryStore::new());
    let limiter = Arc::new(RateLimiter::new(
        store,
        5,
        Duration::from_secs(3600),
    ));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire("source-1").await.unwrap()
        }));
    }

    let mut grants = 0;
    for handle in handles {
        if handle.await.unwrap() == Decision::Grant {
            grants += 1;
        }
    }
    assert_eq!(grants, 5);
}
