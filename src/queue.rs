use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{PipelineError, Result};

/// One logical unit of work per pipeline stage. The scheduler enqueues
/// these; workers execute them through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageTask {
    Collect,
    Generate,
    Tag,
    Publish,
    Cleanup,
}

impl StageTask {
    pub const ALL: [StageTask; 5] = [
        StageTask::Collect,
        StageTask::Generate,
        StageTask::Tag,
        StageTask::Publish,
        StageTask::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageTask::Collect => "collect",
            StageTask::Generate => "generate",
            StageTask::Tag => "tag",
            StageTask::Publish => "publish",
            StageTask::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<StageTask> {
        match s {
            "collect" => Some(StageTask::Collect),
            "generate" => Some(StageTask::Generate),
            "tag" => Some(StageTask::Tag),
            "publish" => Some(StageTask::Publish),
            "cleanup" => Some(StageTask::Cleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task: StageTask,
    pub attempt: i32,
}

/// Distributed task queue with at-least-once delivery: a claimed task whose
/// lease expires becomes claimable again, so every stage must tolerate
/// duplicate execution.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: StageTask) -> Result<Uuid>;

    /// Claim up to `limit` tasks for this worker. Concurrent claimers never
    /// receive the same live task.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<QueuedTask>>;

    /// Acknowledge successful execution; the task is gone.
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Report failed execution; the task is redelivered until its attempt
    /// budget runs out, then parked as dead.
    async fn nack(&self, id: Uuid, error: &str) -> Result<()>;

    /// Number of tasks waiting to be claimed.
    async fn pending(&self) -> Result<u64>;

    /// Delete tasks that ran out of attempts. The scheduler enqueues fresh
    /// stage tasks on every tick, so dead ones carry no information worth
    /// keeping past inspection.
    async fn purge_dead(&self) -> Result<u64>;
}

const DEFAULT_LEASE: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// In-memory queue for tests and single-process runs. Leases are tracked
/// with deadlines so expiry-based redelivery behaves like the Postgres
/// implementation.
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
    lease: Duration,
    max_attempts: i32,
}

#[derive(Default)]
struct MemoryQueueInner {
    pending: VecDeque<QueuedTask>,
    running: HashMap<Uuid, (QueuedTask, Instant)>,
    dead: Vec<QueuedTask>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryQueueInner::default()),
            lease: DEFAULT_LEASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            ..Self::new()
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: StageTask) -> Result<Uuid> {
        let mut inner = self.inner.lock().await;
        let queued = QueuedTask {
            id: Uuid::new_v4(),
            task,
            attempt: 0,
        };
        let id = queued.id;
        inner.pending.push_back(queued);
        Ok(id)
    }

    async fn claim(&self, _worker_id: &str, limit: i64) -> Result<Vec<QueuedTask>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        // Reap expired leases first. A task that already spent its attempt
        // budget killing claimers goes to the dead pile instead of being
        // redelivered forever.
        let expired: Vec<Uuid> = inner
            .running
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((task, _)) = inner.running.remove(&id) {
                if task.attempt >= self.max_attempts {
                    inner.dead.push(task);
                } else {
                    inner.pending.push_back(task);
                }
            }
        }

        let mut claimed = Vec::new();
        while claimed.len() < limit.max(0) as usize {
            let Some(mut task) = inner.pending.pop_front() else {
                break;
            };
            task.attempt += 1;
            inner
                .running
                .insert(task.id, (task.clone(), now + self.lease));
            claimed.push(task);
        }
        Ok(claimed)
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.running.remove(&id);
        Ok(())
    }

    async fn nack(&self, id: Uuid, _error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some((task, _)) = inner.running.remove(&id) {
            if task.attempt < self.max_attempts {
                inner.pending.push_back(task);
            } else {
                inner.dead.push(task);
            }
        }
        Ok(())
    }

    async fn pending(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.pending.len() as u64)
    }

    async fn purge_dead(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let purged = inner.dead.len() as u64;
        inner.dead.clear();
        Ok(purged)
    }
}

/// Postgres-backed queue shared by all worker processes. Claiming uses
/// `FOR UPDATE SKIP LOCKED`; an expired lease makes a running task
/// claimable again.
pub struct PgTaskQueue {
    db: PgPool,
    lease: Duration,
    max_attempts: i32,
}

impl PgTaskQueue {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            lease: DEFAULT_LEASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_lease(db: PgPool, lease: Duration) -> Self {
        Self {
            db,
            lease,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: StageTask) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO tasks (id, kind) VALUES ($1, $2)")
            .bind(id)
            .bind(task.as_str())
            .execute(&self.db)
            .await?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<QueuedTask>> {
        // Expired tasks that already burned their attempt budget are parked
        // as dead rather than redelivered; a claimer that keeps dying never
        // reaches the nack path, so the bound has to live here too.
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'dead', lease_expires_at = NULL, worker_id = NULL
            WHERE status = 'running' AND lease_expires_at < now() AND attempt >= $1
            "#,
        )
        .bind(self.max_attempts)
        .execute(&self.db)
        .await?;

        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running',
                worker_id = $1,
                attempt = attempt + 1,
                lease_expires_at = now() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id FROM tasks
                WHERE ((status = 'pending' AND run_at <= now())
                   OR (status = 'running' AND lease_expires_at < now()))
                  AND attempt < $4
                ORDER BY enqueued_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, attempt
            "#,
        )
        .bind(worker_id)
        .bind(self.lease.as_secs_f64())
        .bind(limit)
        .bind(self.max_attempts)
        .fetch_all(&self.db)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let task = StageTask::parse(&kind)
                .ok_or_else(|| PipelineError::General(format!("unknown task kind: {}", kind)))?;
            claimed.push(QueuedTask {
                id: row.try_get("id")?,
                task,
                attempt: row.try_get("attempt")?,
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn nack(&self, id: Uuid, error: &str) -> Result<()> {
        // Out of attempts: drop the task; the next scheduler tick enqueues a
        // fresh one anyway. Otherwise requeue with a short delay.
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN attempt >= $1 THEN 'dead' ELSE 'pending' END,
                run_at = now() + make_interval(secs => least(attempt * 5, 60)::double precision),
                lease_expires_at = NULL,
                worker_id = NULL,
                last_error = $2
            WHERE id = $3
            "#,
        )
        .bind(self.max_attempts)
        .bind(error)
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM tasks WHERE status = 'pending'")
                .fetch_one(&self.db)
                .await?;
        Ok(count as u64)
    }

    async fn purge_dead(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks WHERE status = 'dead'")
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_hands_each_task_to_one_claimer() {
        let queue = MemoryQueue::new();
        queue.enqueue(StageTask::Collect).await.unwrap();
        queue.enqueue(StageTask::Generate).await.unwrap();

        let first = queue.claim("w1", 10).await.unwrap();
        let second = queue.claim("w2", 10).await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_makes_task_claimable_again() {
        let queue = MemoryQueue::with_lease(Duration::from_millis(0));
        queue.enqueue(StageTask::Publish).await.unwrap();

        let first = queue.claim("w1", 1).await.unwrap();
        assert_eq!(first.len(), 1);

        // Lease of zero is immediately expired; redelivery bumps the attempt.
        let second = queue.claim("w2", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].attempt, 2);
    }

    #[tokio::test]
    async fn acked_task_is_gone() {
        let queue = MemoryQueue::new();
        queue.enqueue(StageTask::Cleanup).await.unwrap();
        let claimed = queue.claim("w1", 1).await.unwrap();
        queue.ack(claimed[0].id).await.unwrap();

        assert!(queue.claim("w1", 1).await.unwrap().is_empty());
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nacked_task_is_redelivered_until_budget_runs_out() {
        let queue = MemoryQueue::new();
        queue.enqueue(StageTask::Tag).await.unwrap();

        let mut deliveries = 0;
        loop {
            let claimed = queue.claim("w1", 1).await.unwrap();
            if claimed.is_empty() {
                break;
            }
            deliveries += 1;
            queue.nack(claimed[0].id, "boom").await.unwrap();
        }
        assert_eq!(deliveries, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn expiry_redelivery_respects_the_attempt_budget() {
        // A claimer that dies without nacking still may not cause endless
        // redelivery; the expiry reaper enforces the same attempt bound.
        let queue = MemoryQueue::with_lease(Duration::from_millis(0));
        queue.enqueue(StageTask::Generate).await.unwrap();

        let mut deliveries = 0;
        loop {
            let claimed = queue.claim("w1", 1).await.unwrap();
            if claimed.is_empty() {
                break;
            }
            deliveries += 1;
            // No ack, no nack: the lease just expires.
        }
        assert_eq!(deliveries, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn purge_dead_drops_exhausted_tasks() {
        let queue = MemoryQueue::new();
        queue.enqueue(StageTask::Publish).await.unwrap();

        loop {
            let claimed = queue.claim("w1", 1).await.unwrap();
            if claimed.is_empty() {
                break;
            }
            queue.nack(claimed[0].id, "boom").await.unwrap();
        }

        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(queue.purge_dead().await.unwrap(), 1);
        assert_eq!(queue.purge_dead().await.unwrap(), 0);
    }
}
