use crate::errors::Result;
use crate::storage::{now_rfc3339, Db};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The single job type the orchestrator enqueues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExecution {
    pub execution_id: i64,
    pub tenant_id: String,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: i64,
    pub body: RunExecution,
    pub attempts: u32,
}

/// SQLite-backed work queue with at-least-once delivery. A dequeued job is
/// invisible until its visibility deadline; unacknowledged jobs become
/// re-deliverable, and jobs dead-letter after `max_deliveries`.
#[derive(Clone)]
pub struct WorkQueue {
    db: Db,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl WorkQueue {
    pub fn new(db: Db, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
            max_deliveries: 3,
        }
    }

    /// Idempotent per execution: re-enqueueing an already-queued execution
    /// is a no-op, which makes `start` replay-safe.
    pub fn enqueue(&self, body: &RunExecution) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO jobs(tenant_id, execution_id, status, attempts, visible_at_ms, enqueued_at)
             VALUES (?1, ?2, 'queued', 0, ?3, ?4)",
            params![body.tenant_id, body.execution_id, now_ms(), now_rfc3339()],
        )?;
        Ok(())
    }

    /// Pops the next visible job, bumping its delivery count and pushing its
    /// visibility deadline out. Jobs past `max_deliveries` are routed to the
    /// dead-letter table instead of being handed out again.
    pub fn dequeue(&self) -> Result<Option<Job>> {
        loop {
            let candidate = {
                let mut conn = self.db.conn.lock().unwrap();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let row = tx
                    .query_row(
                        "SELECT job_id, tenant_id, execution_id, attempts FROM jobs
                         WHERE (status = 'queued' OR (status = 'inflight' AND visible_at_ms <= ?1))
                         ORDER BY job_id ASC LIMIT 1",
                        params![now_ms()],
                        |r| {
                            Ok((
                                r.get::<_, i64>(0)?,
                                r.get::<_, String>(1)?,
                                r.get::<_, i64>(2)?,
                                r.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?;

                let Some((job_id, tenant_id, execution_id, attempts)) = row else {
                    return Ok(None);
                };

                let attempts = attempts as u32 + 1;
                if attempts > self.max_deliveries {
                    tx.execute(
                        "INSERT OR REPLACE INTO dead_letters(job_id, tenant_id, execution_id, attempts, last_error, failed_at)
                         VALUES (?1, ?2, ?3, ?4, 'delivery budget exhausted', ?5)",
                        params![job_id, tenant_id, execution_id, attempts - 1, now_rfc3339()],
                    )?;
                    tx.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
                    tx.commit()?;
                    tracing::warn!(event = "job_dead_lettered", job_id, execution_id);
                    None
                } else {
                    let deadline = now_ms() + self.visibility_timeout.as_millis() as i64;
                    tx.execute(
                        "UPDATE jobs SET status = 'inflight', attempts = ?1, visible_at_ms = ?2 WHERE job_id = ?3",
                        params![attempts, deadline, job_id],
                    )?;
                    tx.commit()?;
                    Some(Job {
                        job_id,
                        body: RunExecution {
                            execution_id,
                            tenant_id,
                        },
                        attempts,
                    })
                }
            };
            if let Some(job) = candidate {
                return Ok(Some(job));
            }
            // dead-lettered one; look for the next candidate
        }
    }

    pub fn ack(&self, job_id: i64) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        Ok(())
    }

    /// Makes the job immediately re-deliverable after a handling failure.
    pub fn nack(&self, job_id: i64, error: &str) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET status = 'queued', visible_at_ms = ?1 WHERE job_id = ?2",
            params![now_ms(), job_id],
        )?;
        tracing::warn!(event = "job_nacked", job_id, error);
        Ok(())
    }

    /// Jobs currently visible or due for redelivery.
    pub fn depth(&self) -> Result<u64> {
        let conn = self.db.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'queued' OR (status = 'inflight' AND visible_at_ms <= ?1)",
            params![now_ms()],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn dead_letter_count(&self) -> Result<u64> {
        let conn = self.db.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl WorkQueue {
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }
}
