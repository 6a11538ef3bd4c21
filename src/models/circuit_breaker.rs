use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// The breaker trips once consecutive failures exceed this value.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Rolling window after which closed-state counters are cleared.
    pub interval: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_requests: u32,
    /// Consecutive half-open successes needed to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(60),
            half_open_max_requests: 5,
            success_threshold: 1,
        }
    }
}
