use crate::errors::{CoreError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub min_calls: usize,
    pub failure_threshold: f64,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_calls: 20,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_inflight: bool },
}

struct Inner {
    state: State,
    outcomes: VecDeque<(Instant, bool)>,
}

/// Failure-rate circuit breaker over a rolling window. Open-state calls
/// fail fast; after the cooldown exactly one probe is admitted, and its
/// outcome decides between closing and re-opening.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: State::Closed,
                outcomes: VecDeque::new(),
            }),
        }
    }

    /// Gate called before each provider attempt.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Closed => Ok(()),
            State::Open { until } => {
                if Instant::now() < until {
                    Err(CoreError::CircuitOpen)
                } else {
                    // cooldown over; this caller becomes the probe
                    inner.state = State::HalfOpen {
                        probe_inflight: true,
                    };
                    Ok(())
                }
            }
            State::HalfOpen { probe_inflight } => {
                if probe_inflight {
                    Err(CoreError::CircuitOpen)
                } else {
                    inner.state = State::HalfOpen {
                        probe_inflight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    pub fn record(&self, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.state {
            State::HalfOpen { .. } => {
                if ok {
                    inner.state = State::Closed;
                    inner.outcomes.clear();
                } else {
                    inner.state = State::Open {
                        until: now + self.cfg.cooldown,
                    };
                }
            }
            State::Closed => {
                inner.outcomes.push_back((now, ok));
                if let Some(horizon) = now.checked_sub(self.cfg.window) {
                    while inner
                        .outcomes
                        .front()
                        .is_some_and(|(at, _)| *at < horizon)
                    {
                        inner.outcomes.pop_front();
                    }
                }
                let total = inner.outcomes.len();
                if total >= self.cfg.min_calls {
                    let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
                    if failures as f64 / total as f64 >= self.cfg.failure_threshold {
                        tracing::warn!(
                            event = "circuit_opened",
                            failures,
                            total,
                            cooldown_s = self.cfg.cooldown.as_secs()
                        );
                        inner.state = State::Open {
                            until: now + self.cfg.cooldown,
                        };
                        inner.outcomes.clear();
                    }
                }
            }
            State::Open { .. } => {}
        }
    }

    /// True while callers should hold off: the cooldown is still running,
    /// or the probe that follows it is in flight. Once the cooldown
    /// elapses this turns false so one waiter can reach `try_acquire` and
    /// claim the probe slot; everyone else sees true again until the probe
    /// resolves.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            State::Open { until } => Instant::now() < until,
            State::HalfOpen { probe_inflight } => probe_inflight,
            State::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_failure_threshold() {
        let b = breaker();
        for i in 0..20 {
            b.try_acquire().unwrap();
            b.record(i % 2 == 0); // 50% failures
        }
        assert!(b.is_open());
        assert!(matches!(b.try_acquire(), Err(CoreError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_min_calls() {
        let b = breaker();
        for _ in 0..19 {
            b.record(false);
        }
        assert!(!b.is_open());
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_after_cooldown() {
        let b = breaker();
        for _ in 0..20 {
            b.record(false);
        }
        assert!(b.is_open());

        tokio::time::advance(Duration::from_secs(31)).await;
        // cooldown over: the gate lifts so one waiter can claim the probe
        assert!(!b.is_open());
        b.try_acquire().unwrap();
        // while the probe is in flight the gate is closed again
        assert!(b.is_open());
        assert!(matches!(b.try_acquire(), Err(CoreError::CircuitOpen)));
        b.record(true);
        assert!(!b.is_open());
        b.try_acquire().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let b = breaker();
        for _ in 0..20 {
            b.record(false);
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        b.try_acquire().unwrap();
        b.record(false);
        assert!(b.is_open());
        assert!(matches!(b.try_acquire(), Err(CoreError::CircuitOpen)));
    }
}
