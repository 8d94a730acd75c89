use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::Settings;
use crate::queue::{StageTask, TaskQueue};
use crate::types::Result;

/// Enqueues one task per stage on that stage's cadence. Scheduling is
/// decoupled from execution: the scheduler only feeds the queue, workers
/// drain it. Losing a tick is harmless because the next one enqueues the
/// same kind of task again.
pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    is_running: Arc<RwLock<bool>>,
    cadences: Vec<(StageTask, Duration)>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, settings: &Settings) -> Self {
        let cadences = vec![
            (StageTask::Collect, settings.collect_interval),
            (StageTask::Generate, settings.generate_interval),
            (StageTask::Tag, settings.tag_interval),
            (StageTask::Publish, settings.publish_interval),
            (StageTask::Cleanup, settings.cleanup_interval),
        ];
        Self {
            queue,
            is_running: Arc::new(RwLock::new(false)),
            cadences,
        }
    }

    /// Spawn one ticker per stage. Returns immediately; call `stop` to wind
    /// the tickers down.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                info!("scheduler already running");
                return Ok(());
            }
            *running = true;
        }

        for (task, interval) in &self.cadences {
            let task = *task;
            let interval = *interval;
            let queue = self.queue.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick fires immediately; that gives each stage an
                // initial run on startup.
                loop {
                    ticker.tick().await;
                    if !*is_running.read().await {
                        break;
                    }
                    if let Err(e) = queue.enqueue(task).await {
                        error!(stage = task.as_str(), error = %e, "failed to enqueue stage task");
                    }
                }
                info!(stage = task.as_str(), "scheduler ticker stopped");
            });
        }

        info!(stages = self.cadences.len(), "scheduler started");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut running = self.is_running.write().await;
        *running = false;
        info!("scheduler stopping");
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}
