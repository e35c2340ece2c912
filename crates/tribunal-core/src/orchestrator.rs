use crate::context::{capability, Context};
use crate::errors::{CoreError, Result};
use crate::events::EventBus;
use crate::model::{Execution, ExecutionParams, ExecutionStatus, TestCase};
use crate::queue::{Job, RunExecution, WorkQueue};
use crate::runner::{CancelFlag, Runner};
use crate::storage::{DefinitionStore, ExecutionStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub case_concurrency: usize,
    pub execution_timeout: Duration,
    /// Fraction of failed cases at which the whole execution is marked
    /// failed. 1.0 means: failed only when nothing completed.
    pub failure_quorum: f64,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            case_concurrency: 5,
            execution_timeout: Duration::from_secs(3600),
            failure_quorum: 1.0,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Turns `start` requests into progressing executions: writes the pending
/// row, enqueues, and later (as a worker) drives every case through the
/// Runner with bounded concurrency.
pub struct Orchestrator {
    pub definitions: DefinitionStore,
    pub executions: ExecutionStore,
    pub queue: WorkQueue,
    pub runner: Arc<Runner>,
    pub events: Arc<EventBus>,
    cfg: OrchestratorConfig,
    cancels: Mutex<HashMap<i64, CancelFlag>>,
}

impl Orchestrator {
    pub fn new(
        definitions: DefinitionStore,
        executions: ExecutionStore,
        queue: WorkQueue,
        runner: Arc<Runner>,
        events: Arc<EventBus>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            definitions,
            executions,
            queue,
            runner,
            events,
            cfg,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Bounded-time entry: row write plus enqueue, no case work inline.
    pub fn start(&self, ctx: &Context, suite_id: i64, params: ExecutionParams) -> Result<Execution> {
        ctx.require(capability::EXECUTION_START)?;
        let (suite, _cases) = self.definitions.get_suite_for_execution(ctx, suite_id, None)?;
        let (execution, created_new) = self.executions.create_execution(ctx, &suite, &params)?;

        // re-enqueue is a no-op, which makes a crash between the row write
        // and the enqueue recoverable by the client's idempotent retry
        if created_new || execution.status == ExecutionStatus::Pending {
            self.queue.enqueue(&RunExecution {
                execution_id: execution.execution_id,
                tenant_id: execution.tenant_id.clone(),
            })?;
        }
        if created_new {
            tracing::info!(
                event = "execution_started",
                tenant = %ctx.tenant_id,
                suite_id,
                execution_id = execution.execution_id
            );
        }
        Ok(execution)
    }

    /// Best-effort: flips the row, then signals in-flight tasks. Cases that
    /// already started may finish and their results are kept.
    pub fn cancel(&self, ctx: &Context, execution_id: i64) -> Result<ExecutionStatus> {
        ctx.require(capability::EXECUTION_CANCEL)?;
        self.executions.get(ctx, execution_id)?;
        self.executions.mark_cancelled(execution_id)?;
        self.flag_for(execution_id).cancel();
        tracing::info!(event = "execution_cancelled", tenant = %ctx.tenant_id, execution_id);
        Ok(ExecutionStatus::Cancelled)
    }

    /// Worker entry for one dequeued job. Domain outcomes (including
    /// failed/cancelled executions) return Ok so the job is acked; only
    /// infrastructure errors propagate for redelivery.
    pub async fn run(&self, job: &Job) -> Result<()> {
        let execution_id = job.body.execution_id;
        let execution = match self.executions.get_internal(execution_id) {
            Ok(e) => e,
            Err(CoreError::NotFound(_)) => {
                tracing::warn!(event = "job_for_unknown_execution", execution_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if execution.status.is_terminal() {
            return Ok(()); // replayed delivery
        }

        let ctx = Context::for_worker(&execution.tenant_id);
        let (_suite, cases) = self.definitions.get_suite_for_execution(
            &ctx,
            execution.suite_id,
            Some(execution.suite_version),
        )?;

        self.executions.mark_running(execution_id)?;
        let execution = self.executions.get_internal(execution_id)?;
        for case in &cases {
            self.executions.record_case_start(&execution, case)?;
        }

        let total = cases.len();
        if total == 0 {
            let summary = self.executions.compute_summary(execution_id)?;
            self.executions.advance_progress(execution_id, 0, 0)?;
            self.executions.mark_completed(execution_id, &summary)?;
            self.finish_events(execution_id, ExecutionStatus::Completed);
            return Ok(());
        }

        let cancel = self.flag_for(execution_id);
        let drive = self.drive_cases(&execution, &cases, &cancel);
        let timed_out = tokio::time::timeout(self.cfg.execution_timeout, drive)
            .await
            .is_err();

        if timed_out {
            cancel.cancel(); // stop detached in-flight tasks at their next checkpoint
            // progress reflects cases completed before the deadline; the
            // sweep below turns the rest terminal without counting them
            let counts = self.executions.case_counts(execution_id)?;
            self.executions
                .advance_progress(execution_id, counts.completed, counts.total)?;
            self.executions.skip_pending(execution_id, "timeout")?;
            self.executions.mark_failed(execution_id, "timeout")?;
            self.finish_events(execution_id, ExecutionStatus::Failed);
            self.drop_flag(execution_id);
            return Ok(());
        }

        let status_now = self.executions.status_internal(execution_id)?;
        if cancel.is_cancelled() || status_now == ExecutionStatus::Cancelled {
            let counts = self.executions.case_counts(execution_id)?;
            self.executions
                .advance_progress(execution_id, counts.completed, counts.total)?;
            self.executions.skip_pending(execution_id, "cancelled")?;
            self.finish_events(execution_id, ExecutionStatus::Cancelled);
            self.drop_flag(execution_id);
            return Ok(());
        }

        let counts = self.executions.case_counts(execution_id)?;
        if counts.completed < counts.total {
            // a case hit an infrastructure error and left pending rows; a
            // terminal status here would orphan them, so hand the job back
            // for redelivery and resume from the unfinished cases
            return Err(CoreError::Internal(format!(
                "execution {} has {} unfinished case(s)",
                execution_id,
                counts.total - counts.completed
            )));
        }
        self.executions
            .advance_progress(execution_id, counts.completed, counts.total)?;
        let summary = self.executions.compute_summary(execution_id)?;

        let failed_frac = if counts.total > 0 {
            counts.failed as f64 / counts.total as f64
        } else {
            0.0
        };
        if failed_frac >= self.cfg.failure_quorum {
            self.executions.mark_failed(execution_id, "cases_failed")?;
            self.finish_events(execution_id, ExecutionStatus::Failed);
        } else {
            self.executions.mark_completed(execution_id, &summary)?;
            self.finish_events(execution_id, ExecutionStatus::Completed);
        }
        self.drop_flag(execution_id);
        Ok(())
    }

    async fn drive_cases(&self, execution: &Execution, cases: &[TestCase], cancel: &CancelFlag) {
        let execution_id = execution.execution_id;
        let total = cases.len();
        let stride = (total / 20).max(1);
        let concurrency = execution
            .params
            .max_concurrent
            .unwrap_or(self.cfg.case_concurrency)
            .clamp(1, 64);
        let sem = Arc::new(Semaphore::new(concurrency));

        let initial = self
            .executions
            .case_counts(execution_id)
            .map(|c| c.completed)
            .unwrap_or(0);
        let done = Arc::new(AtomicUsize::new(initial));
        let mut handles = Vec::new();

        for case in cases {
            // resumption: skip cases that are already fully terminal
            let rows = match self.runner.executions.results_for_case(execution_id, case.case_id) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!(event = "case_rows_unreadable", execution_id, error = %e);
                    continue;
                }
            };
            if !rows.is_empty() && rows.iter().all(|r| r.status.is_terminal()) {
                continue;
            }

            if cancel.is_cancelled() {
                break;
            }
            // a durable cancel from another process lands at the next case
            // boundary
            match self.executions.status_internal(execution_id) {
                Ok(ExecutionStatus::Cancelled) => {
                    cancel.cancel();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(event = "status_check_failed", execution_id, error = %e);
                    break;
                }
            }

            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            // breaker-open backpressure: park (holding the slot) instead of
            // dispatching work that would fail fast
            self.runner.connector.suspend_while_open().await;
            if cancel.is_cancelled() {
                break;
            }
            let runner = self.runner.clone();
            let store = self.executions.clone();
            let execution = execution.clone();
            let case = case.clone();
            let cancel = cancel.clone();
            let done = done.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = runner.run_case(&execution, &case, &cancel).await {
                    tracing::error!(
                        event = "case_run_failed",
                        execution_id = execution.execution_id,
                        case_id = case.case_id,
                        error = %e
                    );
                    return;
                }
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                if n % stride == 0 {
                    if let Err(e) =
                        store.advance_progress(execution.execution_id, n, total)
                    {
                        tracing::warn!(event = "progress_write_failed", error = %e);
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Processes at most one job. Returns false when the queue is empty.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue()? else {
            return Ok(false);
        };
        match self.run(&job).await {
            Ok(()) => self.queue.ack(job.job_id)?,
            Err(e) => {
                tracing::error!(event = "job_failed", job_id = job.job_id, error = %e);
                self.queue.nack(job.job_id, &e.to_string())?;
            }
        }
        Ok(true)
    }

    /// Runs jobs until the queue is empty; returns how many were processed.
    pub async fn drain(&self) -> Result<u64> {
        let mut n = 0;
        while self.process_next().await? {
            n += 1;
        }
        Ok(n)
    }

    /// Long-running worker loop; stops when `shutdown` is flipped.
    pub async fn worker_loop(&self, shutdown: CancelFlag) {
        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.cfg.poll_interval).await,
                Err(e) => {
                    tracing::error!(event = "worker_iteration_failed", error = %e);
                    tokio::time::sleep(self.cfg.poll_interval).await;
                }
            }
        }
    }

    fn finish_events(&self, execution_id: i64, status: ExecutionStatus) {
        self.events.complete(
            execution_id,
            serde_json::json!({ "status": status.as_str() }),
        );
    }

    fn flag_for(&self, execution_id: i64) -> CancelFlag {
        self.cancels
            .lock()
            .unwrap()
            .entry(execution_id)
            .or_default()
            .clone()
    }

    fn drop_flag(&self, execution_id: i64) {
        self.cancels.lock().unwrap().remove(&execution_id);
    }
}
