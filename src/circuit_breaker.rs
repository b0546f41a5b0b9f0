// SPDX-License-Identifier: MIT
//! Circuit breaker guarding calls from the device-adapter handlers into the
//! BLE adapter bridge.
//!
//! Unlike a single-provider breaker, this one is a registry keyed by
//! endpoint id: `"adapter"` for the global scan operations, and a
//! `deviceId` for anything addressed at one connected device. Each key gets
//! its own independent CLOSED/OPEN/HALF_OPEN state so a misbehaving device
//! doesn't trip the breaker for every other device on the same adapter.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                         │
//!   └──────────────(one success)──────── HalfOpen ◄─(reset_timeout elapsed)─┘
//! ```
//!
//! HalfOpen admits at most `half_open_limit` concurrent probes per endpoint;
//! the first successful probe closes the circuit, any failed probe reopens
//! it immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures an endpoint tolerates before its circuit opens.
    pub failure_threshold: u32,
    /// How long an endpoint stays Open before the next call is admitted as
    /// a HalfOpen probe.
    pub reset_timeout: Duration,
    /// Max number of concurrent HalfOpen probes admitted per endpoint.
    pub half_open_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_limit: 1,
        }
    }
}

#[derive(Debug)]
struct EndpointState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_in_flight: 0,
        }
    }
}

/// Per-endpoint CLOSED/OPEN/HALF_OPEN tracker. Endpoints are created lazily
/// on first failure or first state query; an endpoint never queried or
/// failed is implicitly Closed.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    endpoints: RwLock<HashMap<String, EndpointState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `true` if a call to `id` should be attempted. Closed always
    /// admits; Open admits only once `reset_timeout` has elapsed since the
    /// last recorded failure, upgrading the endpoint to HalfOpen and
    /// reserving one probe slot; HalfOpen admits up to `half_open_limit`
    /// concurrent probes.
    pub async fn is_allowed(&self, id: &str) -> bool {
        {
            let endpoints = self.endpoints.read().await;
            match endpoints.get(id).map(|e| e.state) {
                None | Some(CircuitState::Closed) => return true,
                Some(CircuitState::HalfOpen) | Some(CircuitState::Open) => {
                    // fall through to the write-locked path below
                }
            }
        }

        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints.entry(id.to_string()).or_insert_with(EndpointState::new);
        match entry.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if entry.half_open_in_flight < self.config.half_open_limit {
                    entry.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                let elapsed = entry.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed < self.config.reset_timeout {
                    return false;
                }
                info!(endpoint = id, "circuit breaker -> half_open (probe admitted)");
                entry.state = CircuitState::HalfOpen;
                entry.half_open_in_flight = 1;
                true
            }
        }
    }

    /// Records a successful call. A single success closes a HalfOpen
    /// endpoint; in Closed state it resets the failure count.
    pub async fn record_success(&self, id: &str) {
        let mut endpoints = self.endpoints.write().await;
        let Some(entry) = endpoints.get_mut(id) else {
            return;
        };
        match entry.state {
            CircuitState::HalfOpen => {
                info!(endpoint = id, "circuit breaker -> closed");
                entry.state = CircuitState::Closed;
                entry.failure_count = 0;
                entry.half_open_in_flight = 0;
                entry.last_failure = None;
            }
            CircuitState::Closed => entry.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Records a failed call. Opens the endpoint once `failure_threshold`
    /// consecutive failures accumulate from Closed, or immediately on a
    /// failed HalfOpen probe.
    pub async fn record_failure(&self, id: &str) {
        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints.entry(id.to_string()).or_insert_with(EndpointState::new);
        entry.last_failure = Some(Instant::now());
        match entry.state {
            CircuitState::Closed => {
                entry.failure_count += 1;
                if entry.failure_count >= self.config.failure_threshold {
                    warn!(endpoint = id, failures = entry.failure_count, "circuit breaker -> open");
                    entry.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(endpoint = id, "circuit breaker -> open (probe failed)");
                entry.state = CircuitState::Open;
                entry.half_open_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self, id: &str) -> CircuitState {
        self.endpoints.read().await.get(id).map(|e| e.state).unwrap_or(CircuitState::Closed)
    }

    pub async fn failure_count(&self, id: &str) -> u32 {
        self.endpoints.read().await.get(id).map(|e| e.failure_count).unwrap_or(0)
    }

    /// Returns `id` to Closed and clears its counters.
    pub async fn reset(&self, id: &str) {
        self.endpoints.write().await.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            half_open_limit: 1,
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new(fast_config());
        assert_eq!(cb.state("ble-adapter-0").await, CircuitState::Closed);
        assert!(cb.is_allowed("ble-adapter-0").await);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_config());
        cb.record_failure("ble-adapter-0").await;
        cb.record_failure("ble-adapter-0").await;
        assert_eq!(cb.state("ble-adapter-0").await, CircuitState::Closed);
        cb.record_failure("ble-adapter-0").await;
        assert_eq!(cb.state("ble-adapter-0").await, CircuitState::Open);
        assert!(!cb.is_allowed("ble-adapter-0").await);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("ble-adapter-0").await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed("ble-adapter-0").await);
        assert_eq!(cb.state("ble-adapter-0").await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn single_success_closes_from_half_open() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("ble-adapter-0").await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed("ble-adapter-0").await);
        cb.record_success("ble-adapter-0").await;
        assert_eq!(cb.state("ble-adapter-0").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_limit_caps_concurrent_probes() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            half_open_limit: 1,
        });
        cb.record_failure("device-1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.is_allowed("device-1").await);
        assert!(!cb.is_allowed("device-1").await);
    }

    #[tokio::test]
    async fn reopens_on_probe_failure() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("ble-adapter-0").await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed("ble-adapter-0").await);
        cb.record_failure("ble-adapter-0").await;
        assert_eq!(cb.state("ble-adapter-0").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count_in_closed() {
        let cb = CircuitBreaker::new(fast_config());
        cb.record_failure("device-1").await;
        cb.record_failure("device-1").await;
        cb.record_success("device-1").await;
        assert_eq!(cb.state("device-1").await, CircuitState::Closed);
        assert_eq!(cb.failure_count("device-1").await, 0);
    }

    #[tokio::test]
    async fn endpoints_are_tracked_independently() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("device-1").await;
        }
        assert_eq!(cb.state("device-1").await, CircuitState::Open);
        assert_eq!(cb.state("device-2").await, CircuitState::Closed);
        assert!(cb.is_allowed("device-2").await);
    }

    #[tokio::test]
    async fn reset_clears_endpoint_state() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure("device-1").await;
        }
        cb.reset("device-1").await;
        assert_eq!(cb.state("device-1").await, CircuitState::Closed);
    }
}
