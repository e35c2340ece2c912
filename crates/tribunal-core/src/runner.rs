use crate::connector::{InvokeParameters, InvokeRequest, Message, ModelConnector};
use crate::errors::Result;
use crate::evaluator::{EvalContext, Registry};
use crate::events::EventBus;
use crate::model::{CaseStatus, EventKind, Execution, TestCase};
use crate::storage::executions::{ExecutionStore, ResultWrite};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};

const EPSILON: f64 = 1e-9;

/// Cooperative cancellation signal checked at suspension points.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub evaluator_timeout: Duration,
    pub evaluator_fanout: usize,
    pub call_timeout: Duration,
    /// Conversation target when `params.conversation_spec_id` is absent.
    pub default_conversation_model: String,
    pub judge_model: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            evaluator_timeout: Duration::from_secs(30),
            evaluator_fanout: 4,
            call_timeout: Duration::from_secs(60),
            default_conversation_model: "default".into(),
            judge_model: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaseOutcome {
    pub case_id: i64,
    pub conversation_failed: bool,
}

/// Executes a single test case end to end: conversation call, evaluator
/// fan-out, exactly-once result writes, event frames.
pub struct Runner {
    pub executions: ExecutionStore,
    pub connector: Arc<ModelConnector>,
    pub registry: Arc<Registry>,
    pub events: Arc<EventBus>,
    pub cfg: RunnerConfig,
}

impl Runner {
    pub async fn run_case(
        &self,
        execution: &Execution,
        case: &TestCase,
        cancel: &CancelFlag,
    ) -> Result<CaseOutcome> {
        let execution_id = execution.execution_id;
        self.events.emit(
            execution_id,
            EventKind::CaseStarted,
            serde_json::json!({ "case_id": case.case_id }),
        );

        // rows were pre-created pending; a redelivered job sees the
        // terminal ones and only works the remainder
        let rows = self.executions.results_for_case(execution_id, case.case_id)?;
        let pending: BTreeMap<String, i64> = rows
            .iter()
            .filter(|r| r.status == CaseStatus::Pending)
            .map(|r| (r.evaluator_kind.clone(), r.result_id))
            .collect();
        if pending.is_empty() {
            return Ok(CaseOutcome {
                case_id: case.case_id,
                conversation_failed: false,
            });
        }

        if cancel.is_cancelled() {
            for result_id in pending.values() {
                self.executions
                    .record_case_result(*result_id, &ResultWrite::skipped("cancelled"))?;
            }
            self.emit_finished(execution_id, case.case_id, serde_json::json!([]));
            return Ok(CaseOutcome {
                case_id: case.case_id,
                conversation_failed: false,
            });
        }

        let response = match self.invoke_conversation(execution, case).await {
            Ok(resp) => resp,
            Err(e) => {
                let kind = e.kind();
                tracing::warn!(
                    event = "conversation_failed",
                    execution_id,
                    case_id = case.case_id,
                    error_kind = kind
                );
                for result_id in pending.values() {
                    self.executions
                        .record_case_result(*result_id, &ResultWrite::failed(kind))?;
                }
                self.emit_finished(
                    execution_id,
                    case.case_id,
                    serde_json::json!({ "error_kind": kind }),
                );
                return Ok(CaseOutcome {
                    case_id: case.case_id,
                    conversation_failed: true,
                });
            }
        };

        let writes = self
            .evaluate_all(execution, case, cancel, &pending, &response.text)
            .await;

        // evaluators ran concurrently; rows are written in the case's
        // declared kind order
        let mut verdicts = Vec::new();
        let panicked = ResultWrite::failed("internal");
        for kind in &case.evaluator_kinds {
            let Some(result_id) = pending.get(kind) else {
                continue;
            };
            let write = writes.get(kind).unwrap_or(&panicked);
            let row = self.executions.record_case_result(*result_id, write)?;
            verdicts.push(serde_json::json!({
                "evaluator_kind": kind,
                "status": row.status.as_str(),
                "score": row.score,
                "passed": row.passed,
                "error_kind": row.error_kind,
            }));
        }

        self.emit_finished(execution_id, case.case_id, serde_json::json!(verdicts));
        Ok(CaseOutcome {
            case_id: case.case_id,
            conversation_failed: false,
        })
    }

    async fn invoke_conversation(
        &self,
        execution: &Execution,
        case: &TestCase,
    ) -> Result<crate::connector::InvokeResponse> {
        let model_id = execution
            .params
            .conversation_spec_id
            .clone()
            .unwrap_or_else(|| self.cfg.default_conversation_model.clone());

        let mut messages = Vec::new();
        if let Some(obj) = case.context.as_object() {
            if !obj.is_empty() {
                messages.push(Message::system(format!(
                    "Context:\n{}",
                    serde_json::to_string_pretty(&case.context).unwrap_or_default()
                )));
            }
        }
        messages.push(Message::user(case.user_input.clone()));

        self.connector
            .invoke(InvokeRequest {
                model_id,
                messages,
                parameters: InvokeParameters::default(),
                timeout: self.cfg.call_timeout,
                idempotency_key: Some(format!("{}:{}", execution.execution_id, case.case_id)),
                tenant_id: execution.tenant_id.clone(),
            })
            .await
    }

    async fn evaluate_all(
        &self,
        execution: &Execution,
        case: &TestCase,
        cancel: &CancelFlag,
        pending: &BTreeMap<String, i64>,
        system_response: &str,
    ) -> BTreeMap<String, ResultWrite> {
        let sem = Arc::new(Semaphore::new(self.cfg.evaluator_fanout.max(1)));
        let mut handles = Vec::new();

        for kind in &case.evaluator_kinds {
            if !pending.contains_key(kind) {
                continue;
            }
            let kind = kind.clone();
            let sem = sem.clone();
            let cancel = cancel.clone();
            let registry = self.registry.clone();
            let case = case.clone();
            let response = system_response.to_string();
            let cx = EvalContext {
                connector: self.connector.clone(),
                judge_model: self.cfg.judge_model.clone(),
                tenant_id: execution.tenant_id.clone(),
                idempotency_key: format!(
                    "{}:{}:{}",
                    execution.execution_id, case.case_id, kind
                ),
                call_timeout: self.cfg.call_timeout,
            };
            let evaluator_timeout = self.cfg.evaluator_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                if cancel.is_cancelled() {
                    return (kind, ResultWrite::skipped("cancelled"));
                }
                let Some(evaluator) = registry.get(&kind) else {
                    return (kind, ResultWrite::skipped("unknown_evaluator"));
                };

                let started = Instant::now();
                let outcome =
                    timeout(evaluator_timeout, evaluator.evaluate(&case, &response, &cx)).await;
                let latency_ms = started.elapsed().as_millis() as i64;

                let write = match outcome {
                    Ok(Ok(verdict)) => {
                        let score = verdict.score.clamp(0.0, 1.0);
                        let passed = match case.expected.get(&kind).and_then(|e| e.min_score) {
                            Some(threshold) => score + EPSILON >= threshold,
                            None => verdict.passed,
                        };
                        ResultWrite {
                            status: CaseStatus::Ok,
                            score: Some(score),
                            passed: Some(passed),
                            reasoning: Some(verdict.reasoning),
                            system_response: Some(response.clone()),
                            latency_ms: Some(latency_ms),
                            error_kind: None,
                        }
                    }
                    Ok(Err(e)) => ResultWrite {
                        latency_ms: Some(latency_ms),
                        ..ResultWrite::failed(e.kind())
                    },
                    Err(_) => ResultWrite {
                        latency_ms: Some(latency_ms),
                        ..ResultWrite::failed("timeout")
                    },
                };
                (kind, write)
            }));
        }

        let mut writes = BTreeMap::new();
        for handle in handles {
            match handle.await {
                Ok((kind, write)) => {
                    writes.insert(kind, write);
                }
                Err(e) => {
                    tracing::error!(event = "evaluator_task_panicked", error = %e);
                }
            }
        }
        writes
    }

    fn emit_finished(&self, execution_id: i64, case_id: i64, verdicts: serde_json::Value) {
        self.events.emit(
            execution_id,
            EventKind::CaseFinished,
            serde_json::json!({ "case_id": case_id, "verdicts": verdicts }),
        );
    }
}
