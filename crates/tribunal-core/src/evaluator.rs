use crate::connector::ModelConnector;
use crate::errors::{CoreError, Result};
use crate::model::{TestCase, Verdict};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything an evaluator may touch besides the case and the response.
/// The connector is the only allowed side effect.
#[derive(Clone)]
pub struct EvalContext {
    pub connector: Arc<ModelConnector>,
    pub judge_model: String,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub call_timeout: Duration,
}

/// A named, pure evaluation function over `(case, system_response)`.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Pass threshold used when the case supplies no `min_score` for this
    /// kind.
    fn default_threshold(&self) -> f64 {
        0.5
    }

    async fn evaluate(
        &self,
        case: &TestCase,
        system_response: &str,
        cx: &EvalContext,
    ) -> Result<Verdict>;
}

/// Catalog of evaluator kinds. Populated once at startup; duplicate
/// registration fails fast. Iteration order is stable.
#[derive(Default)]
pub struct Registry {
    by_kind: BTreeMap<String, Arc<dyn Evaluator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, evaluator: Arc<dyn Evaluator>) -> Result<()> {
        let kind = evaluator.kind().to_string();
        if self.by_kind.contains_key(&kind) {
            return Err(CoreError::Conflict(format!(
                "evaluator kind already registered: {}",
                kind
            )));
        }
        self.by_kind.insert(kind, evaluator);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Evaluator>> {
        self.by_kind.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.by_kind.keys().map(|k| k.as_str()).collect()
    }
}
