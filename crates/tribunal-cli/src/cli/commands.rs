use super::args::*;
use crate::exit_codes;
use crate::seed;
use std::sync::Arc;
use tribunal_core::config::CoreConfig;
use tribunal_core::connector::echo::EchoProvider;
use tribunal_core::connector::http::HttpProvider;
use tribunal_core::connector::{BreakerConfig, ConnectorConfig, ModelConnector, Provider};
use tribunal_core::errors::{CoreError, Result};
use tribunal_core::events::EventBus;
use tribunal_core::orchestrator::{Orchestrator, OrchestratorConfig};
use tribunal_core::queue::WorkQueue;
use tribunal_core::runner::{Runner, RunnerConfig};
use tribunal_core::storage::{Db, DefinitionStore, ExecutionStore};

pub async fn dispatch(cli: Cli) -> i32 {
    let outcome = match cli.cmd {
        Command::Migrate(args) => cmd_migrate(args),
        Command::Seed(args) => cmd_seed(args),
        Command::Init(args) => cmd_init(args),
        Command::Worker(args) => cmd_worker(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };
    match outcome {
        Ok(()) => exit_codes::OK,
        Err(e) => {
            eprintln!("error: {}", e);
            exit_codes::for_error(&e)
        }
    }
}

fn cmd_migrate(args: MigrateArgs) -> Result<()> {
    let db = Db::open(&args.db)?;
    db.init_schema()?;
    eprintln!("schema ready at {}", args.db.display());
    Ok(())
}

fn cmd_seed(args: SeedArgs) -> Result<()> {
    let db = Db::open(&args.db)?;
    db.init_schema()?;
    let store = DefinitionStore::new(db);
    let report = seed::load_file(&store, &args.file)?;
    eprintln!(
        "seeded {} suite(s), {} case(s) from {}",
        report.suites,
        report.cases,
        args.file.display()
    );
    Ok(())
}

fn cmd_init(args: InitArgs) -> Result<()> {
    seed::write_sample(&args.file)?;
    eprintln!("created {}", args.file.display());
    Ok(())
}

async fn cmd_worker(args: WorkerArgs) -> Result<()> {
    let cfg = CoreConfig::from_env()?;
    let poll_interval = std::time::Duration::from_millis(args.poll_ms.max(10));
    let orchestrator = build_orchestrator(&cfg, &args.provider, poll_interval)?;

    if args.drain {
        let n = orchestrator.drain().await?;
        eprintln!("drained {} job(s)", n);
        return Ok(());
    }

    tracing::info!(event = "worker_loop_start", poll_ms = args.poll_ms);
    orchestrator
        .worker_loop(tribunal_core::runner::CancelFlag::new())
        .await;
    Ok(())
}

fn build_orchestrator(
    cfg: &CoreConfig,
    provider_choice: &str,
    poll_interval: std::time::Duration,
) -> Result<Arc<Orchestrator>> {
    let db = Db::open(std::path::Path::new(&cfg.db_url))?;
    db.init_schema()?;

    let provider: Arc<dyn Provider> = match provider_choice {
        "echo" => Arc::new(EchoProvider),
        "http" => {
            let endpoint = cfg.model_provider_endpoint.clone().ok_or_else(|| {
                CoreError::Invalid("MODEL_PROVIDER_ENDPOINT is required for --provider http".into())
            })?;
            let key = cfg.model_provider_key.clone().ok_or_else(|| {
                CoreError::Invalid("MODEL_PROVIDER_KEY is required for --provider http".into())
            })?;
            Arc::new(HttpProvider::new(endpoint, key))
        }
        other => {
            return Err(CoreError::Invalid(format!(
                "unknown provider {:?} (expected http or echo)",
                other
            )))
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

    let definitions = DefinitionStore::new(db.clone());
    let executions = ExecutionStore::new(db.clone());
    let queue = WorkQueue::new(db, cfg.execution_timeout);
    let events = Arc::new(EventBus::new());
    let runner = Arc::new(Runner {
        executions: executions.clone(),
        connector,
        registry: Arc::new(tribunal_evaluators::default_registry()?),
        events: events.clone(),
        cfg: RunnerConfig {
            evaluator_timeout: cfg.eval_timeout,
            evaluator_fanout: cfg.evaluator_fanout,
            call_timeout: cfg.call_timeout,
            ..Default::default()
        },
    });

    Ok(Arc::new(Orchestrator::new(
        definitions,
        executions,
        queue,
        runner,
        events,
        OrchestratorConfig {
            case_concurrency: cfg.case_concurrency,
            execution_timeout: cfg.execution_timeout,
            poll_interval,
            ..Default::default()
        },
    )))
}
