use crate::auth::Authorizer;
use std::sync::Arc;
use std::time::Instant;
use tribunal_core::config::CoreConfig;
use tribunal_core::connector::echo::EchoProvider;
use tribunal_core::connector::http::HttpProvider;
use tribunal_core::connector::{BreakerConfig, ConnectorConfig, ModelConnector, Provider};
use tribunal_core::errors::Result;
use tribunal_core::events::EventBus;
use tribunal_core::orchestrator::{Orchestrator, OrchestratorConfig};
use tribunal_core::queue::WorkQueue;
use tribunal_core::runner::{Runner, RunnerConfig};
use tribunal_core::storage::{Db, DefinitionStore, ExecutionStore};

#[derive(Clone)]
pub struct AppState {
    pub definitions: DefinitionStore,
    pub executions: ExecutionStore,
    pub orchestrator: Arc<Orchestrator>,
    pub events: Arc<EventBus>,
    pub connector: Arc<ModelConnector>,
    pub authorizer: Arc<dyn Authorizer>,
    pub started_at: Instant,
}

impl AppState {
    /// Wires the whole core together from config: shared DB handle, stores,
    /// connector (HTTP provider when an endpoint is configured, echo
    /// otherwise), registry, runner, orchestrator.
    pub fn build(cfg: &CoreConfig, authorizer: Arc<dyn Authorizer>) -> Result<AppState> {
        let db = Db::open(std::path::Path::new(&cfg.db_url))?;
        db.init_schema()?;
        Self::build_with_db(cfg, authorizer, db)
    }

    pub fn build_with_db(
        cfg: &CoreConfig,
        authorizer: Arc<dyn Authorizer>,
        db: Db,
    ) -> Result<AppState> {
        let definitions = DefinitionStore::new(db.clone());
        let executions = ExecutionStore::new(db.clone());
        let queue = WorkQueue::new(db, cfg.execution_timeout);

        let provider: Arc<dyn Provider> = match (&cfg.model_provider_endpoint, &cfg.model_provider_key)
        {
            (Some(endpoint), Some(key)) => Arc::new(HttpProvider::new(endpoint, key)),
            _ => {
                tracing::warn!(event = "provider_fallback_echo");
                Arc::new(EchoProvider)
            }
        };
        let connector = Arc::new(ModelConnector::new(
            provider,
            ConnectorConfig {
                rate_limit_per_second: cfg.rate_limit_per_second,
                breaker: BreakerConfig {
                    failure_threshold: cfg.circuit_failure_threshold,
                    ..Default::default()
                },
                ..Default::default()
            },
        ));

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(tribunal_evaluators::default_registry()?);
        let runner = Arc::new(Runner {
            executions: executions.clone(),
            connector: connector.clone(),
            registry,
            events: events.clone(),
            cfg: RunnerConfig {
                evaluator_timeout: cfg.eval_timeout,
                evaluator_fanout: cfg.evaluator_fanout,
                call_timeout: cfg.call_timeout,
                ..Default::default()
            },
        });
        let orchestrator = Arc::new(Orchestrator::new(
            definitions.clone(),
            executions.clone(),
            queue,
            runner,
            events.clone(),
            OrchestratorConfig {
                case_concurrency: cfg.case_concurrency,
                execution_timeout: cfg.execution_timeout,
                ..Default::default()
            },
        ));

        Ok(AppState {
            definitions,
            executions,
            orchestrator,
            events,
            connector,
            authorizer,
            started_at: Instant::now(),
        })
    }
}
