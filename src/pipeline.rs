use std::sync::Arc;

use crate::cleanup::{Cleanup, CleanupConfig};
use crate::collector::Collector;
use crate::config::Settings;
use crate::filter::KeywordFilter;
use crate::generator::{Generator, GeneratorConfig};
use crate::limiter::RateLimiter;
use crate::llm::TextGenerator;
use crate::publisher::{Publisher, PublisherConfig};
use crate::queue::{StageTask, TaskQueue};
use crate::sources::FetcherRegistry;
use crate::store::Store;
use crate::tagger::{Tagger, TaggerConfig};
use crate::transport::Transport;
use crate::types::Result;

/// Wires the stages to their shared dependencies and dispatches queued
/// stage tasks. Workers hold one of these; the stages themselves stay
/// independent so they can run (and fail) separately.
pub struct Pipeline {
    collector: Collector,
    generator: Generator,
    tagger: Tagger,
    publisher: Publisher,
    cleanup: Cleanup,
}

impl Pipeline {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<FetcherRegistry>,
        llm: Arc<dyn TextGenerator>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let limiter = RateLimiter::new(
            store.clone(),
            settings.rate_limit_per_window,
            settings.rate_limit_window,
        );
        let filter = KeywordFilter::new(settings.keywords.clone());

        let collector = Collector::new(store.clone(), registry, limiter, filter);
        let generator = Generator::new(
            store.clone(),
            llm.clone(),
            GeneratorConfig {
                prompt_template: settings.prompt_template.clone(),
                min_generated_len: settings.min_generated_len,
                max_retries: settings.max_retries,
                retry_base_delay: settings.retry_base_delay,
                batch: settings.generate_batch,
                claim_timeout: settings.generation_timeout,
            },
        );
        let tagger = Tagger::new(
            store.clone(),
            llm,
            TaggerConfig {
                max_tags: settings.max_tags,
                batch: settings.generate_batch,
            },
        );
        let publisher = Publisher::new(
            store.clone(),
            transport,
            PublisherConfig {
                auto_approve: settings.auto_approve,
                max_retries: settings.max_retries,
                retry_base_delay: settings.retry_base_delay,
                batch: settings.publish_batch,
            },
        );
        let cleanup = Cleanup::new(
            store,
            queue,
            CleanupConfig {
                retention_days: settings.retention_days,
                batch: settings.cleanup_batch,
            },
        );

        Self {
            collector,
            generator,
            tagger,
            publisher,
            cleanup,
        }
    }

    /// Execute one stage task. Per-item failures are absorbed inside the
    /// stages; an error here means infrastructure trouble and propagates to
    /// the queue's redelivery.
    pub async fn execute(&self, task: StageTask) -> Result<()> {
        match task {
            StageTask::Collect => {
                self.collector.run().await?;
            }
            StageTask::Generate => {
                self.generator.run().await?;
            }
            StageTask::Tag => {
                self.tagger.run().await?;
            }
            StageTask::Publish => {
                self.publisher.run().await?;
            }
            StageTask::Cleanup => {
                self.cleanup.run().await?;
            }
        }
        Ok(())
    }

    /// Run every stage once, in pipeline order. Used by `--once` mode.
    pub async fn run_all_once(&self) -> Result<()> {
        for task in StageTask::ALL {
            self.execute(task).await?;
        }
        Ok(())
    }
}
