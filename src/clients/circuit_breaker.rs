//! In-process circuit breaker guarding downstream calls.
//!
//! ```text
//! Closed   -> Open:     consecutive failures exceed the threshold
//! Open     -> HalfOpen: after the open timeout
//! HalfOpen -> Closed:   `success_threshold` consecutive trial successes
//! HalfOpen -> Open:     any trial failure
//! ```
//!
//! While closed, counters are cleared every `interval` so that sporadic old
//! failures never add up to a trip. Every state change starts a new
//! generation; outcomes of calls admitted in an older generation are
//! ignored. A call whose future is dropped before it completes gives its
//! request slot back, so abandoned half-open calls never exhaust the limit.

use std::{future::Future, sync::Mutex};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::BreakerError,
    models::circuit_breaker::{CircuitBreakerConfig, CircuitState},
};

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// End of the current closed interval or open timeout.
    expiry: Option<Instant>,
}

pub struct CircuitBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service_name = service_name.into();
        info!(service = %service_name, "Circuit breaker initialized");

        let expiry = Some(Instant::now() + config.interval);
        Self {
            service_name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.service_name
    }

    /// Current state, after applying any elapsed timeout.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Runs `operation` unless the breaker rejects it.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let call = self.before_call::<E>()?;

        match operation().await {
            Ok(result) => {
                call.finish(true);
                Ok(result)
            }
            Err(e) => {
                call.finish(false);
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Critical sections never panic; recover the data if one ever did.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn before_call<E>(&self) -> Result<AdmittedCall<'_>, BreakerError<E>> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Open => {
                warn!(service = %self.service_name, "Circuit breaker is open, rejecting request");
                return Err(BreakerError::Open);
            }
            CircuitState::HalfOpen if inner.counts.requests >= self.config.half_open_max_requests => {
                debug!(service = %self.service_name, "Half-open call limit reached");
                return Err(BreakerError::TooManyRequests);
            }
            _ => {}
        }

        inner.counts.requests += 1;
        Ok(AdmittedCall {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn abandon_call(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        inner.counts.requests = inner.counts.requests.saturating_sub(1);
        debug!(service = %self.service_name, "Call abandoned before completion");
    }

    fn after_call(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.consecutive_successes += 1;
            inner.counts.consecutive_failures = 0;

            if inner.state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= self.config.success_threshold
            {
                self.transition(&mut inner, CircuitState::Closed, now);
                info!(service = %self.service_name, "Circuit breaker closed after successful recovery");
            }
            return;
        }

        inner.counts.consecutive_failures += 1;
        inner.counts.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                debug!(
                    service = %self.service_name,
                    failures = inner.counts.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );

                if inner.counts.consecutive_failures > self.config.failure_threshold {
                    warn!(
                        service = %self.service_name,
                        failures = inner.counts.consecutive_failures,
                        "Circuit breaker opened due to consecutive failures"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service_name, "Circuit breaker reopened after failed recovery attempt");
                self.transition(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Applies time-driven changes: interval resets and open timeouts.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let Some(expiry) = inner.expiry else {
            return;
        };
        if now < expiry {
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                inner.generation += 1;
                inner.counts = Counts::default();
                inner.expiry = Some(now + self.config.interval);
            }
            CircuitState::Open => {
                info!(service = %self.service_name, "Circuit breaker attempting reset");
                self.transition(inner, CircuitState::HalfOpen, now);
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        inner.state = state;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match state {
            CircuitState::Closed => Some(now + self.config.interval),
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

/// Slot taken by an admitted call; settles the outcome exactly once.
struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl AdmittedCall<'_> {
    fn finish(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_call(self.generation, success);
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon_call(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 2,
                timeout: Duration::from_secs(30),
                interval: Duration::from_secs(60),
                half_open_max_requests: 1,
                success_threshold: 1,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.execute(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let cb = breaker();

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_a_bounded_number_of_calls() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        {
            let mut inner = cb.lock();
            let now = Instant::now();
            cb.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        let trial = cb.before_call::<()>().unwrap();
        assert!(matches!(
            cb.before_call::<()>(),
            Err(BreakerError::TooManyRequests)
        ));

        trial.finish(true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_call_returns_its_slot() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        {
            let mut inner = cb.lock();
            let now = Instant::now();
            cb.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        drop(cb.before_call::<()>().unwrap());

        succeed(&cb).await.expect("slot was released");
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
