use crate::errors::{CoreError, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub mod breaker;
pub mod echo;
pub mod http;
pub mod limiter;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use limiter::RateLimiter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeParameters {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for InvokeParameters {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 800,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub parameters: InvokeParameters,
    pub timeout: Duration,
    pub idempotency_key: Option<String>,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Rough blended pricing, in USD. Good enough for budget dashboards.
    pub fn estimated_cost_usd(&self) -> f64 {
        self.input_tokens as f64 * 3e-6 + self.output_tokens as f64 * 15e-6
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
}

/// Outbound port to a single model provider. Implementations classify HTTP
/// failures into the shared error taxonomy; retries, limits, and breaking
/// happen above them in `ModelConnector`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the wire protocol accepts an idempotency key. When it does
    /// not, the connector dedupes in memory instead.
    fn supports_idempotency(&self) -> bool {
        false
    }

    async fn call(&self, req: &InvokeRequest) -> Result<InvokeResponse>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            factor: 2.0,
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Full jitter: uniform over [0, min(cap, base * factor^(attempt-1))].
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let ceiling = exp.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=ceiling))
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub retry: RetryPolicy,
    pub rate_limit_per_second: f64,
    pub breaker: BreakerConfig,
    pub dedupe_window: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit_per_second: 10.0,
            breaker: BreakerConfig::default(),
            dedupe_window: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    failures: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_micro_usd: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Single entry point for all outbound model traffic: per-call timeout,
/// jittered retries, a shared token bucket, a circuit breaker, and an
/// in-memory idempotency window.
pub struct ModelConnector {
    provider: Arc<dyn Provider>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    dedupe: moka::sync::Cache<String, InvokeResponse>,
    counters: Counters,
    cfg: ConnectorConfig,
}

impl ModelConnector {
    pub fn new(provider: Arc<dyn Provider>, cfg: ConnectorConfig) -> Self {
        Self {
            limiter: RateLimiter::new(cfg.rate_limit_per_second),
            breaker: CircuitBreaker::new(cfg.breaker.clone()),
            dedupe: moka::sync::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(cfg.dedupe_window)
                .build(),
            counters: Counters::default(),
            provider,
            cfg,
        }
    }

    pub async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse> {
        // when the provider honors the forwarded key, dedupe is its job;
        // otherwise the in-memory window makes the call idempotent here
        let dedupe_key = if self.provider.supports_idempotency() {
            None
        } else {
            req.idempotency_key
                .as_deref()
                .map(|k| dedupe_key(&req.tenant_id, k))
        };
        if let Some(key) = &dedupe_key {
            if let Some(hit) = self.dedupe.get(key) {
                return Ok(hit);
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // breaker gate: callers park while the circuit is open or a
            // probe is in flight; when the cooldown elapses exactly one of
            // them is admitted as the probe and the rest keep waiting, so
            // an open circuit never turns into a terminal case failure
            while self.breaker.try_acquire().is_err() {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            self.limiter.acquire().await;

            let started = Instant::now();
            let outcome = match tokio::time::timeout(req.timeout, self.provider.call(&req)).await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CoreError::Timeout(format!(
                    "provider call exceeded {}s",
                    req.timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(mut resp) => {
                    resp.latency_ms = started.elapsed().as_millis() as u64;
                    self.breaker.record(true);
                    self.record_success(&resp);
                    if let Some(key) = &dedupe_key {
                        self.dedupe.insert(key.clone(), resp.clone());
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    self.breaker.record(false);
                    self.counters.calls.fetch_add(1, Ordering::Relaxed);
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if e.is_retryable() && attempt < self.cfg.retry.max_attempts {
                        let delay = self.cfg.retry.backoff(attempt);
                        tracing::debug!(
                            event = "provider_retry",
                            provider = self.provider.name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            kind = e.kind()
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Backpressure hook for the orchestrator: parks the caller until the
    /// breaker's cooldown elapses and the follow-up probe resolves.
    pub async fn suspend_while_open(&self) {
        while self.breaker.is_open() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    pub fn circuit_is_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.counters.calls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            input_tokens: self.counters.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.counters.output_tokens.load(Ordering::Relaxed),
            estimated_cost_usd: self.counters.cost_micro_usd.load(Ordering::Relaxed) as f64 / 1e6,
        }
    }

    fn record_success(&self, resp: &InvokeResponse) {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .input_tokens
            .fetch_add(resp.usage.input_tokens, Ordering::Relaxed);
        self.counters
            .output_tokens
            .fetch_add(resp.usage.output_tokens, Ordering::Relaxed);
        self.counters.cost_micro_usd.fetch_add(
            (resp.usage.estimated_cost_usd() * 1e6) as u64,
            Ordering::Relaxed,
        );
    }
}

fn dedupe_key(tenant_id: &str, idempotency_key: &str) -> String {
    let mut h = Sha256::new();
    h.update(tenant_id.as_bytes());
    h.update(b"\n");
    h.update(idempotency_key.as_bytes());
    format!("{:x}", h.finalize())
}
