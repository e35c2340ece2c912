#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tribunal_core::connector::{
    ConnectorConfig, InvokeRequest, InvokeResponse, ModelConnector, Provider, TokenUsage,
};
use tribunal_core::context::{Context, Role};
use tribunal_core::errors::{CoreError, Result};
use tribunal_core::evaluator::{EvalContext, Evaluator, Registry};
use tribunal_core::events::EventBus;
use tribunal_core::model::{CasePayload, Expectation, TestCase, Verdict};
use tribunal_core::orchestrator::{Orchestrator, OrchestratorConfig};
use tribunal_core::queue::WorkQueue;
use tribunal_core::runner::{Runner, RunnerConfig};
use tribunal_core::storage::{Db, DefinitionStore, ExecutionStore};

pub fn admin_ctx() -> Context {
    Context::new("t1", Role::Admin, "tester")
}

pub fn other_tenant_ctx() -> Context {
    Context::new("t2", Role::Admin, "intruder")
}

/// Evaluator that returns a fixed score without touching the connector.
pub struct ScoreEvaluator {
    pub kind: &'static str,
    pub score: f64,
}

#[async_trait]
impl Evaluator for ScoreEvaluator {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn evaluate(
        &self,
        _case: &TestCase,
        _system_response: &str,
        _cx: &EvalContext,
    ) -> Result<Verdict> {
        Ok(Verdict {
            score: self.score,
            passed: self.score >= 0.5,
            reasoning: "fixed".into(),
        })
    }
}

/// Evaluator that always errors; failures must stay isolated to its row.
pub struct FailingEvaluator;

#[async_trait]
impl Evaluator for FailingEvaluator {
    fn kind(&self) -> &'static str {
        "flaky_judge"
    }

    async fn evaluate(
        &self,
        _case: &TestCase,
        _system_response: &str,
        _cx: &EvalContext,
    ) -> Result<Verdict> {
        Err(CoreError::Internal("judge blew up".into()))
    }
}

/// Provider that can be flipped between healthy and failing at runtime.
pub struct SwitchableProvider {
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl SwitchableProvider {
    pub fn new(failing: bool) -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(failing),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Provider for SwitchableProvider {
    fn name(&self) -> &'static str {
        "switchable"
    }

    async fn call(&self, req: &InvokeRequest) -> Result<InvokeResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("upstream down".into()));
        }
        let last = req
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(InvokeResponse {
            text: format!("echo: {}", last),
            usage: TokenUsage {
                input_tokens: 2,
                output_tokens: 2,
            },
            latency_ms: 0,
        })
    }
}

/// Provider whose calls block on a semaphore after `free_calls`; used to
/// hold an execution mid-flight while the test cancels it.
pub struct GatedProvider {
    pub free_calls: usize,
    pub calls: AtomicUsize,
    pub gate: tokio::sync::Semaphore,
}

impl GatedProvider {
    pub fn new(free_calls: usize) -> Arc<Self> {
        Arc::new(Self {
            free_calls,
            calls: AtomicUsize::new(0),
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    pub fn release_all(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl Provider for GatedProvider {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn call(&self, _req: &InvokeRequest) -> Result<InvokeResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n >= self.free_calls {
            let _permit = self.gate.acquire().await.map_err(CoreError::internal)?;
        }
        Ok(InvokeResponse {
            text: "gated reply".into(),
            usage: TokenUsage::default(),
            latency_ms: 0,
        })
    }
}

pub struct Harness {
    pub db: Db,
    pub definitions: DefinitionStore,
    pub executions: ExecutionStore,
    pub events: Arc<EventBus>,
    pub connector: Arc<ModelConnector>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn test_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(Arc::new(ScoreEvaluator {
            kind: "answer_relevancy",
            score: 0.9,
        }))
        .unwrap();
    registry
        .register(Arc::new(ScoreEvaluator {
            kind: "faithfulness",
            score: 0.7,
        }))
        .unwrap();
    registry.register(Arc::new(FailingEvaluator)).unwrap();
    registry
}

pub fn fast_connector_cfg() -> ConnectorConfig {
    ConnectorConfig {
        rate_limit_per_second: 10_000.0,
        ..Default::default()
    }
}

pub fn harness(provider: Arc<dyn Provider>) -> Harness {
    harness_with(provider, fast_connector_cfg(), OrchestratorConfig::default())
}

pub fn harness_with(
    provider: Arc<dyn Provider>,
    connector_cfg: ConnectorConfig,
    orch_cfg: OrchestratorConfig,
) -> Harness {
    let db = Db::open_in_memory().unwrap();
    db.init_schema().unwrap();

    let definitions = DefinitionStore::new(db.clone());
    let executions = ExecutionStore::new(db.clone());
    let queue = WorkQueue::new(db.clone(), orch_cfg.execution_timeout);
    let events = Arc::new(EventBus::new());
    let connector = Arc::new(ModelConnector::new(provider, connector_cfg));
    let runner = Arc::new(Runner {
        executions: executions.clone(),
        connector: connector.clone(),
        registry: Arc::new(test_registry()),
        events: events.clone(),
        cfg: RunnerConfig {
            evaluator_timeout: Duration::from_secs(5),
            evaluator_fanout: 4,
            call_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    });
    let orchestrator = Arc::new(Orchestrator::new(
        definitions.clone(),
        executions.clone(),
        queue,
        runner,
        events.clone(),
        orch_cfg,
    ));

    Harness {
        db,
        definitions,
        executions,
        events,
        connector,
        orchestrator,
    }
}

pub fn case_payload(kinds: &[&str], min_score: Option<f64>) -> CasePayload {
    let mut expected = std::collections::BTreeMap::new();
    if let Some(score) = min_score {
        for kind in kinds {
            expected.insert(
                kind.to_string(),
                Expectation {
                    min_score: Some(score),
                },
            );
        }
    }
    CasePayload {
        evaluator_kinds: kinds.iter().map(|k| k.to_string()).collect(),
        expected,
        user_input: "hi".into(),
        context: serde_json::json!({}),
        source_conversation_id: None,
    }
}
