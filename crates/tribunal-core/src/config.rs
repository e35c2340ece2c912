use crate::errors::{CoreError, Result};
use std::time::Duration;

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub db_url: String,
    pub queue_url: String,
    pub dlq_url: String,
    pub model_provider_endpoint: Option<String>,
    pub model_provider_key: Option<String>,
    pub rate_limit_per_second: f64,
    pub circuit_failure_threshold: f64,
    pub eval_timeout: Duration,
    pub execution_timeout: Duration,
    pub call_timeout: Duration,
    pub case_concurrency: usize,
    pub evaluator_fanout: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_url: ".tribunal/tribunal.db".into(),
            queue_url: ".tribunal/tribunal.db".into(),
            dlq_url: ".tribunal/tribunal.db".into(),
            model_provider_endpoint: None,
            model_provider_key: None,
            rate_limit_per_second: 10.0,
            circuit_failure_threshold: 0.5,
            eval_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(60),
            case_concurrency: 5,
            evaluator_fanout: 4,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let d = CoreConfig::default();
        let db_url = std::env::var("DB_URL").unwrap_or(d.db_url);
        // The queue and dead-letter tables live in SQLite; absent overrides
        // they share the primary database file.
        let queue_url = std::env::var("QUEUE_URL").unwrap_or_else(|_| db_url.clone());
        let dlq_url = std::env::var("DLQ_URL").unwrap_or_else(|_| queue_url.clone());

        Ok(Self {
            db_url,
            queue_url,
            dlq_url,
            model_provider_endpoint: std::env::var("MODEL_PROVIDER_ENDPOINT").ok(),
            model_provider_key: std::env::var("MODEL_PROVIDER_KEY").ok(),
            rate_limit_per_second: env_f64("RATE_LIMIT_PER_SECOND", d.rate_limit_per_second)?,
            circuit_failure_threshold: env_f64(
                "CIRCUIT_FAILURE_THRESHOLD",
                d.circuit_failure_threshold,
            )?,
            eval_timeout: Duration::from_secs(env_u64("EVAL_TIMEOUT_SECONDS", 30)?),
            execution_timeout: Duration::from_secs(env_u64("EXECUTION_TIMEOUT_SECONDS", 3600)?),
            call_timeout: Duration::from_secs(env_u64("MODEL_CALL_TIMEOUT_SECONDS", 60)?),
            case_concurrency: env_u64("CASE_CONCURRENCY", 5)? as usize,
            evaluator_fanout: env_u64("EVALUATOR_FANOUT", 4)? as usize,
        })
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<f64>()
            .map_err(|_| CoreError::Invalid(format!("{} must be a number, got {:?}", key, v))),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| CoreError::Invalid(format!("{} must be an integer, got {:?}", key, v))),
        Err(_) => Ok(default),
    }
}
