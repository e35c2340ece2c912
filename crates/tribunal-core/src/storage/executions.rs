use crate::context::{capability, Context};
use crate::errors::{CoreError, Result};
use crate::model::{
    CaseResult, CaseStatus, Execution, ExecutionParams, ExecutionStatus, ExecutionStatusView,
    Suite, TestCase,
};
use crate::storage::{now_rfc3339, Db};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;

/// Terminal write for one `(case, evaluator_kind)` row.
#[derive(Debug, Clone)]
pub struct ResultWrite {
    pub status: CaseStatus,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub reasoning: Option<String>,
    pub system_response: Option<String>,
    pub latency_ms: Option<i64>,
    pub error_kind: Option<String>,
}

impl ResultWrite {
    pub fn failed(error_kind: &str) -> Self {
        Self {
            status: CaseStatus::Failed,
            score: None,
            passed: None,
            reasoning: None,
            system_response: None,
            latency_ms: None,
            error_kind: Some(error_kind.to_string()),
        }
    }

    pub fn skipped(error_kind: &str) -> Self {
        Self {
            status: CaseStatus::Skipped,
            error_kind: Some(error_kind.to_string()),
            ..Self::failed(error_kind)
        }
    }
}

/// Per-case completion counters used by the orchestrator for resume and
/// progress accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Tracks execution aggregates and per-case results.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Db,
}

impl ExecutionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Idempotent creation keyed by `(tenant, suite, idempotency_key)`.
    /// Returns `(execution, created_new)`.
    pub fn create_execution(
        &self,
        ctx: &Context,
        suite: &Suite,
        params_in: &ExecutionParams,
    ) -> Result<(Execution, bool)> {
        ctx.require(capability::EXECUTION_START)?;
        let params_json = serde_json::to_string(params_in)?;
        let now = now_rfc3339();

        if let Some(key) = &ctx.idempotency_key {
            if let Some(existing) = self.find_by_idempotency(ctx, suite.suite_id, key)? {
                return Ok((existing, false));
            }
        }

        let conn = self.db.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO executions(tenant_id, suite_id, suite_version, status, progress_pct, idempotency_key, params, started_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6)",
            params![
                ctx.tenant_id,
                suite.suite_id,
                suite.version,
                ctx.idempotency_key,
                params_json,
                now
            ],
        );
        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                drop(conn);
                Ok((self.get(ctx, id)?, true))
            }
            Err(e) => {
                drop(conn);
                // lost the insert race on the idempotency index
                if let (CoreError::Conflict(_), Some(key)) =
                    (CoreError::from(e), &ctx.idempotency_key)
                {
                    if let Some(existing) = self.find_by_idempotency(ctx, suite.suite_id, key)? {
                        return Ok((existing, false));
                    }
                }
                Err(CoreError::Internal("execution insert failed".into()))
            }
        }
    }

    fn find_by_idempotency(
        &self,
        ctx: &Context,
        suite_id: i64,
        key: &str,
    ) -> Result<Option<Execution>> {
        let conn = self.db.conn.lock().unwrap();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE tenant_id = ?1 AND suite_id = ?2 AND idempotency_key = ?3", EXEC_COLS),
                params![ctx.tenant_id, suite_id, key],
                execution_from_row,
            )
            .optional()?)
    }

    pub fn get(&self, ctx: &Context, execution_id: i64) -> Result<Execution> {
        ctx.require(capability::EXECUTION_READ)?;
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM executions WHERE tenant_id = ?1 AND execution_id = ?2", EXEC_COLS),
            params![ctx.tenant_id, execution_id],
            execution_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("execution {}", execution_id)))
    }

    /// Worker-side load; the tenant boundary was already enforced when the
    /// job was enqueued with the row's own tenant id.
    pub fn get_internal(&self, execution_id: i64) -> Result<Execution> {
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM executions WHERE execution_id = ?1", EXEC_COLS),
            params![execution_id],
            execution_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("execution {}", execution_id)))
    }

    /// Executions of one suite, newest first. Suites hold no back-pointer;
    /// this is served from the `(tenant_id, suite_id)` secondary index.
    pub fn list_for_suite(&self, ctx: &Context, suite_id: i64) -> Result<Vec<Execution>> {
        ctx.require(capability::EXECUTION_READ)?;
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions WHERE tenant_id = ?1 AND suite_id = ?2 ORDER BY execution_id DESC",
            EXEC_COLS
        ))?;
        let rows = stmt.query_map(params![ctx.tenant_id, suite_id], execution_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_status(&self, ctx: &Context, execution_id: i64) -> Result<ExecutionStatusView> {
        let e = self.get(ctx, execution_id)?;
        Ok(ExecutionStatusView {
            status: e.status,
            progress_pct: e.progress_pct,
        })
    }

    pub fn status_internal(&self, execution_id: i64) -> Result<ExecutionStatus> {
        Ok(self.get_internal(execution_id)?.status)
    }

    pub fn mark_running(&self, execution_id: i64) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE executions SET status = 'running' WHERE execution_id = ?1 AND status = 'pending'",
            params![execution_id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        drop(conn);
        match self.status_internal(execution_id)? {
            // crash-resume path: a redelivered job re-enters run()
            ExecutionStatus::Running => Ok(()),
            other => Err(CoreError::IllegalTransition {
                from: other.as_str().into(),
                to: "running".into(),
            }),
        }
    }

    pub fn mark_completed(&self, execution_id: i64, summary: &serde_json::Value) -> Result<()> {
        self.finish(execution_id, ExecutionStatus::Completed, Some(summary), None)
    }

    pub fn mark_failed(&self, execution_id: i64, error_kind: &str) -> Result<()> {
        self.finish(execution_id, ExecutionStatus::Failed, None, Some(error_kind))
    }

    pub fn mark_cancelled(&self, execution_id: i64) -> Result<()> {
        let conn = self.db.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE executions SET status = 'cancelled', finished_at = ?1
             WHERE execution_id = ?2 AND status IN ('pending', 'running')",
            params![now_rfc3339(), execution_id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        drop(conn);
        let from = self.status_internal(execution_id)?;
        Err(CoreError::IllegalTransition {
            from: from.as_str().into(),
            to: "cancelled".into(),
        })
    }

    fn finish(
        &self,
        execution_id: i64,
        to: ExecutionStatus,
        summary: Option<&serde_json::Value>,
        error_kind: Option<&str>,
    ) -> Result<()> {
        let summary_json = match summary {
            Some(s) => Some(serde_json::to_string(s)?),
            None => None,
        };
        let conn = self.db.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE executions SET status = ?1, summary = COALESCE(?2, summary), error_kind = COALESCE(?3, error_kind), finished_at = ?4
             WHERE execution_id = ?5 AND status = 'running'",
            params![to.as_str(), summary_json, error_kind, now_rfc3339(), execution_id],
        )?;
        if changed == 1 {
            return Ok(());
        }
        drop(conn);
        let from = self.status_internal(execution_id)?;
        Err(CoreError::IllegalTransition {
            from: from.as_str().into(),
            to: to.as_str().into(),
        })
    }

    /// Pre-creates one pending row per `(case, kind)`. Idempotent: rows that
    /// already exist (redelivered job) are left untouched.
    pub fn record_case_start(&self, execution: &Execution, case: &TestCase) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.db.conn.lock().unwrap();
        for kind in &case.evaluator_kinds {
            conn.execute(
                "INSERT OR IGNORE INTO case_results(tenant_id, execution_id, case_id, case_version, evaluator_kind, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    execution.tenant_id,
                    execution.execution_id,
                    case.case_id,
                    case.version,
                    kind,
                    now
                ],
            )?;
        }
        Ok(())
    }

    /// Transitions a pending row to a terminal state exactly once. A second
    /// invocation is a no-op that returns the already-written row.
    pub fn record_case_result(&self, result_id: i64, write: &ResultWrite) -> Result<CaseResult> {
        if !write.status.is_terminal() {
            return Err(CoreError::Invalid(
                "case result transition must be terminal".into(),
            ));
        }
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "UPDATE case_results SET status = ?1, score = ?2, passed = ?3, reasoning = ?4, system_response = ?5, latency_ms = ?6, error_kind = ?7, finished_at = ?8
             WHERE result_id = ?9 AND status = 'pending'",
            params![
                write.status.as_str(),
                write.score,
                write.passed,
                write.reasoning,
                write.system_response,
                write.latency_ms,
                write.error_kind,
                now_rfc3339(),
                result_id
            ],
        )?;
        conn.query_row(
            &format!("SELECT {} FROM case_results WHERE result_id = ?1", RESULT_COLS),
            params![result_id],
            result_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("case result {}", result_id)))
    }

    pub fn results_for_case(&self, execution_id: i64, case_id: i64) -> Result<Vec<CaseResult>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM case_results WHERE execution_id = ?1 AND case_id = ?2 ORDER BY result_id ASC",
            RESULT_COLS
        ))?;
        let rows = stmt.query_map(params![execution_id, case_id], result_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn results_for_execution(&self, execution_id: i64) -> Result<Vec<CaseResult>> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM case_results WHERE execution_id = ?1 ORDER BY case_id ASC, result_id ASC",
            RESULT_COLS
        ))?;
        let rows = stmt.query_map(params![execution_id], result_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Sweeps every still-pending row to `skipped` (cancellation and
    /// wall-clock wind-down).
    pub fn skip_pending(&self, execution_id: i64, error_kind: &str) -> Result<usize> {
        let conn = self.db.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE case_results SET status = 'skipped', error_kind = ?1, finished_at = ?2
             WHERE execution_id = ?3 AND status = 'pending'",
            params![error_kind, now_rfc3339(), execution_id],
        )?;
        Ok(changed)
    }

    /// Compare-and-set progress write; a stale writer can never move the
    /// value backwards.
    pub fn advance_progress(&self, execution_id: i64, completed: usize, total: usize) -> Result<u8> {
        let pct = if total == 0 {
            100
        } else {
            ((completed * 100) / total) as u8
        };
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "UPDATE executions SET progress_pct = ?1
             WHERE execution_id = ?2 AND progress_pct <= ?1 AND status IN ('running', 'pending', 'cancelled')",
            params![pct as i64, execution_id],
        )?;
        Ok(pct)
    }

    pub fn case_counts(&self, execution_id: i64) -> Result<CaseCounts> {
        let results = self.results_for_execution(execution_id)?;
        Ok(counts_from_results(&results))
    }

    pub fn get_summary(&self, ctx: &Context, execution_id: i64) -> Result<serde_json::Value> {
        let e = self.get(ctx, execution_id)?;
        if let Some(summary) = e.summary {
            return Ok(summary);
        }
        self.compute_summary(execution_id)
    }

    /// Pass rates per evaluator kind, per-case outcomes, latency quantiles,
    /// and error counts, from the result rows alone.
    pub fn compute_summary(&self, execution_id: i64) -> Result<serde_json::Value> {
        let results = self.results_for_execution(execution_id)?;
        let counts = counts_from_results(&results);

        #[derive(Default)]
        struct KindAgg {
            total: usize,
            ok: usize,
            failed: usize,
            skipped: usize,
            passed: usize,
            latencies: Vec<i64>,
        }

        let mut kinds: BTreeMap<String, KindAgg> = BTreeMap::new();
        let mut error_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut cases: BTreeMap<i64, Vec<&CaseResult>> = BTreeMap::new();

        for r in &results {
            let agg = kinds.entry(r.evaluator_kind.clone()).or_default();
            agg.total += 1;
            match r.status {
                CaseStatus::Ok => {
                    agg.ok += 1;
                    if r.passed == Some(true) {
                        agg.passed += 1;
                    }
                    if let Some(ms) = r.latency_ms {
                        agg.latencies.push(ms);
                    }
                }
                CaseStatus::Failed => agg.failed += 1,
                CaseStatus::Skipped => agg.skipped += 1,
                CaseStatus::Pending => {}
            }
            if let Some(err) = &r.error_kind {
                *error_counts.entry(err.clone()).or_default() += 1;
            }
            cases.entry(r.case_id).or_default().push(r);
        }

        let mut kinds_json = serde_json::Map::new();
        let mut passed_total = 0usize;
        let mut ok_total = 0usize;
        for (kind, mut agg) in kinds {
            agg.latencies.sort_unstable();
            passed_total += agg.passed;
            ok_total += agg.ok;
            kinds_json.insert(
                kind,
                serde_json::json!({
                    "total": agg.total,
                    "ok": agg.ok,
                    "failed": agg.failed,
                    "skipped": agg.skipped,
                    "pass_rate": if agg.ok > 0 { agg.passed as f64 / agg.ok as f64 } else { 0.0 },
                    "p50_latency_ms": percentile(&agg.latencies, 50.0),
                    "p95_latency_ms": percentile(&agg.latencies, 95.0),
                }),
            );
        }

        let mut cases_json = serde_json::Map::new();
        for (case_id, rows) in &cases {
            let outcome = if rows.iter().any(|r| r.status == CaseStatus::Pending) {
                "pending"
            } else if rows.iter().all(|r| r.status == CaseStatus::Failed) {
                "failed"
            } else {
                "completed"
            };
            cases_json.insert(
                case_id.to_string(),
                serde_json::json!({
                    "outcome": outcome,
                    "results": rows.iter().map(|r| serde_json::json!({
                        "evaluator_kind": r.evaluator_kind,
                        "status": r.status.as_str(),
                        "score": r.score,
                        "passed": r.passed,
                        "error_kind": r.error_kind,
                    })).collect::<Vec<_>>(),
                }),
            );
        }

        Ok(serde_json::json!({
            "cases": {
                "total": counts.total,
                "completed": counts.completed - counts.failed,
                "failed": counts.failed,
            },
            "evaluators": kinds_json,
            "per_case": cases_json,
            "error_counts": error_counts,
            "pass_rate": if ok_total > 0 { passed_total as f64 / ok_total as f64 } else { 0.0 },
        }))
    }
}

fn counts_from_results(results: &[CaseResult]) -> CaseCounts {
    let mut by_case: BTreeMap<i64, (bool, bool)> = BTreeMap::new(); // (all_terminal, all_failed)
    for r in results {
        let entry = by_case.entry(r.case_id).or_insert((true, true));
        entry.0 &= r.status.is_terminal();
        entry.1 &= r.status == CaseStatus::Failed;
    }
    let total = by_case.len();
    let completed = by_case.values().filter(|(t, _)| *t).count();
    let failed = by_case.values().filter(|(t, f)| *t && *f).count();
    CaseCounts {
        total,
        completed,
        failed,
    }
}

// nearest-rank percentile
fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil().max(1.0) as usize;
    sorted.get(rank - 1).copied()
}

const EXEC_COLS: &str = "execution_id, tenant_id, suite_id, suite_version, status, progress_pct, summary, idempotency_key, params, error_kind, started_at, finished_at";

fn execution_from_row(r: &Row<'_>) -> rusqlite::Result<Execution> {
    let status_raw: String = r.get(4)?;
    let summary: Option<String> = r.get(6)?;
    let params_raw: String = r.get(8)?;
    Ok(Execution {
        execution_id: r.get(0)?,
        tenant_id: r.get(1)?,
        suite_id: r.get(2)?,
        suite_version: r.get(3)?,
        status: ExecutionStatus::parse(&status_raw).unwrap_or(ExecutionStatus::Failed),
        progress_pct: r.get::<_, i64>(5)? as u8,
        summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
        idempotency_key: r.get(7)?,
        params: serde_json::from_str(&params_raw).unwrap_or_default(),
        error_kind: r.get(9)?,
        started_at: r.get(10)?,
        finished_at: r.get(11)?,
    })
}

const RESULT_COLS: &str = "result_id, tenant_id, execution_id, case_id, case_version, evaluator_kind, status, score, passed, reasoning, system_response, latency_ms, error_kind";

fn result_from_row(r: &Row<'_>) -> rusqlite::Result<CaseResult> {
    let status_raw: String = r.get(6)?;
    let passed: Option<i64> = r.get(8)?;
    Ok(CaseResult {
        result_id: r.get(0)?,
        tenant_id: r.get(1)?,
        execution_id: r.get(2)?,
        case_id: r.get(3)?,
        case_version: r.get(4)?,
        evaluator_kind: r.get(5)?,
        status: CaseStatus::parse(&status_raw).unwrap_or(CaseStatus::Failed),
        score: r.get(7)?,
        passed: passed.map(|v| v != 0),
        reasoning: r.get(9)?,
        system_response: r.get(10)?,
        latency_ms: r.get(11)?,
        error_kind: r.get(12)?,
    })
}
