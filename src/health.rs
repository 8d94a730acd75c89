use std::sync::Arc;
use tracing::warn;

use crate::llm::TextGenerator;
use crate::queue::TaskQueue;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub store_ok: bool,
    pub generator_ok: bool,
    pub queue_pending: Option<u64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_ok && self.generator_ok && self.queue_pending.is_some()
    }
}

/// Probes the external dependencies the pipeline needs to make progress.
pub struct HealthCheck {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    llm: Arc<dyn TextGenerator>,
}

impl HealthCheck {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        llm: Arc<dyn TextGenerator>,
    ) -> Self {
        Self { store, queue, llm }
    }

    pub async fn run(&self) -> HealthReport {
        let store_ok = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store probe failed");
                false
            }
        };
        let generator_ok = match self.llm.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "generator probe failed");
                false
            }
        };
        let queue_pending = match self.queue.pending().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "queue probe failed");
                None
            }
        };

        HealthReport {
            store_ok,
            generator_ok,
            queue_pending,
        }
    }
}
