use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::pipeline::Pipeline;
use crate::queue::TaskQueue;
use crate::types::Result;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: String,
    pub batch: i64,
    pub poll_interval: Duration,
}

/// Claims stage tasks from the queue and runs them through the pipeline,
/// acking on success and nacking on failure so the queue redelivers.
///
/// Every stage tolerates duplicate execution, so the worker never needs to
/// deduplicate deliveries itself.
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    is_running: Arc<RwLock<bool>>,
}

impl Worker {
    pub fn new(queue: Arc<dyn TaskQueue>, pipeline: Arc<Pipeline>, config: WorkerConfig) -> Self {
        Self {
            queue,
            pipeline,
            config,
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Poll loop until `stop` is called. Claim errors back off to the next
    /// poll instead of tearing the worker down.
    pub async fn run(&self) {
        {
            let mut running = self.is_running.write().await;
            if *running {
                info!(worker = %self.config.id, "worker already running");
                return;
            }
            *running = true;
        }
        info!(worker = %self.config.id, "worker started");

        while *self.is_running.read().await {
            match self.drain().await {
                Ok(0) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!(worker = %self.config.id, error = %e, "claim failed, backing off");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        info!(worker = %self.config.id, "worker stopped");
    }

    /// Claim one batch and execute it. Returns the number of tasks claimed;
    /// zero means the queue is idle.
    pub async fn drain(&self) -> Result<usize> {
        let tasks = self.queue.claim(&self.config.id, self.config.batch).await?;
        let claimed = tasks.len();

        for queued in tasks {
            match self.pipeline.execute(queued.task).await {
                Ok(()) => self.queue.ack(queued.id).await?,
                Err(e) => {
                    warn!(
                        worker = %self.config.id,
                        stage = queued.task.as_str(),
                        attempt = queued.attempt,
                        error = %e,
                        "stage task failed"
                    );
                    self.queue.nack(queued.id, &e.to_string()).await?;
                }
            }
        }
        Ok(claimed)
    }

    pub async fn stop(&self) {
        let mut running = self.is_running.write().await;
        *running = false;
    }
}
