use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::util::lock_unpoisoned;

const DEFAULT_PATH: &str = "/";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Declarative per-host health probing and recovery configuration.
/// Intervals and timeouts are in seconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Probe path, e.g. `/healthz`.
    pub path: String,
    /// Probe method; GET unless set to POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// JSON request body sent when the method is POST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Probe interval in seconds; probing is disabled at 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Per-probe timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Expected status of a healthy probe. One of 200, 201, 204.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_status: Option<u16>,
    /// Consecutive successes required to close the breaker again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    /// Consecutive failures after which the breaker opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
}

impl HealthCheckConfig {
    /// Validate the configuration and build the runtime policy.
    pub fn to_policy(&self) -> Result<HealthCheckPolicy, Error> {
        let method = match self.method.as_deref() {
            None | Some("") | Some("GET") => Method::GET,
            Some("POST") => Method::POST,
            Some(_) => return Err(Error::InvalidHealthCheckMethod),
        };

        let success_status = match self.success_status {
            None => StatusCode::OK,
            Some(200) => StatusCode::OK,
            Some(201) => StatusCode::CREATED,
            Some(204) => StatusCode::NO_CONTENT,
            Some(_) => return Err(Error::InvalidHealthCheckSuccessStatus),
        };

        if self.success_threshold == Some(0) || self.failure_threshold == Some(0) {
            return Err(Error::InvalidHealthCheckThreshold);
        }
        let success_threshold = self.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD);
        let failure_threshold = self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD);

        let body = match &self.body {
            Some(value) => Bytes::from(
                serde_json::to_vec(value).map_err(|source| Error::Serialize { source })?,
            ),
            None => Bytes::new(),
        };

        let interval = match self.interval {
            Some(0) => Duration::ZERO,
            Some(seconds) => Duration::from_secs(seconds),
            None => DEFAULT_INTERVAL,
        };
        let timeout = match self.timeout {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds),
            _ => DEFAULT_TIMEOUT,
        };

        // The breaker re-admits a trial request just before the next probe
        // would fire.
        let delay = interval
            .checked_sub(Duration::from_millis(1))
            .filter(|_| !interval.is_zero())
            .unwrap_or(DEFAULT_INTERVAL);

        Ok(HealthCheckPolicy {
            path: if self.path.is_empty() {
                DEFAULT_PATH.to_owned()
            } else {
                self.path.clone()
            },
            method,
            headers: self.headers.clone(),
            body,
            timeout,
            interval,
            success_status,
            breaker: CircuitBreaker::new(success_threshold, failure_threshold, delay),
        })
    }
}

/// Runtime health-check policy: probe shape plus the circuit breaker it
/// drives.
#[derive(Debug)]
pub struct HealthCheckPolicy {
    pub(crate) path: String,
    pub(crate) method: Method,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) body: Bytes,
    pub(crate) timeout: Duration,
    interval: Duration,
    success_status: StatusCode,
    breaker: CircuitBreaker,
}

impl HealthCheckPolicy {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn try_acquire_permit(&self) -> bool {
        self.breaker.try_acquire_permit()
    }

    pub(crate) fn record_success(&self) {
        self.breaker.record_success();
    }

    pub(crate) fn record_failure(&self) {
        self.breaker.record_failure();
    }

    /// Classify an active probe outcome: success iff the response arrived
    /// with exactly the configured success status.
    pub(crate) fn record_probe(&self, status: Option<StatusCode>) {
        match status {
            Some(status) if status == self.success_status => self.breaker.record_success(),
            _ => self.breaker.record_failure(),
        }
    }
}

/// Circuit breaker states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-count circuit breaker driven by both active probes and
/// in-band response outcomes.
///
/// Starts half-open so the very first recorded outcome produces a state
/// change event. `try_acquire_permit` promotes `open -> half-open` once
/// the recovery delay has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    success_threshold: u32,
    failure_threshold: u32,
    delay: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(success_threshold: u32, failure_threshold: u32, delay: Duration) -> Self {
        Self {
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
            delay,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::HalfOpen,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        lock_unpoisoned(&self.inner).state
    }

    pub fn record_success(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.consecutive_failures = 0;
        match inner.state {
            // An open breaker only recovers through the delay-gated
            // half-open trial; successes from fallback dispatch stay put.
            BreakerState::Closed | BreakerState::Open => {}
            BreakerState::HalfOpen => {
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                if inner.consecutive_successes >= self.success_threshold {
                    transition(&mut inner, BreakerState::Closed);
                }
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// When open, admit a trial request once the recovery delay elapsed,
    /// moving to half-open. Closed and half-open states always permit.
    pub fn try_acquire_permit(&self) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .is_none_or(|opened_at| opened_at.elapsed() >= self.delay);
                if expired {
                    transition(&mut inner, BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }
}

fn transition(inner: &mut BreakerInner, next: BreakerState) {
    let previous = inner.state;
    inner.state = next;
    inner.consecutive_failures = 0;
    inner.consecutive_successes = 0;
    debug!(from = %previous, to = %next, "circuit breaker state changed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_breaker(success_threshold: u32, failure_threshold: u32) -> CircuitBreaker {
        let breaker = CircuitBreaker::new(
            success_threshold,
            failure_threshold,
            Duration::from_millis(20),
        );
        // Walk out of the initial half-open state.
        for _ in 0..success_threshold {
            breaker.record_success();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker
    }

    #[test]
    fn initial_state_is_half_open() {
        let breaker = CircuitBreaker::new(1, 1, Duration::from_millis(20));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn opens_after_exactly_failure_threshold_consecutive_failures() {
        let breaker = closed_breaker(1, 3);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let breaker = closed_breaker(1, 2);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_goes_half_open_after_delay_then_closes_on_successes() {
        let breaker = closed_breaker(2, 1);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire_permit());

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire_permit());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn success_while_open_does_not_close_the_breaker() {
        let breaker = closed_breaker(1, 1);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // A fallback-dispatched request may succeed while the breaker is
        // still open; that must not bypass the half-open trial.
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire_permit());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_reopens_on_any_failure() {
        let breaker = closed_breaker(2, 1);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.try_acquire_permit());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn config_validation() {
        let config = HealthCheckConfig {
            path: "/healthz".to_owned(),
            method: Some("DELETE".to_owned()),
            ..HealthCheckConfig::default()
        };
        assert!(matches!(
            config.to_policy(),
            Err(Error::InvalidHealthCheckMethod)
        ));

        let config = HealthCheckConfig {
            path: "/healthz".to_owned(),
            success_status: Some(302),
            ..HealthCheckConfig::default()
        };
        assert!(matches!(
            config.to_policy(),
            Err(Error::InvalidHealthCheckSuccessStatus)
        ));

        let config = HealthCheckConfig {
            path: "/healthz".to_owned(),
            failure_threshold: Some(0),
            ..HealthCheckConfig::default()
        };
        assert!(matches!(
            config.to_policy(),
            Err(Error::InvalidHealthCheckThreshold)
        ));
    }

    #[test]
    fn probe_classification_uses_exact_success_status() {
        let config = HealthCheckConfig {
            path: "/healthz".to_owned(),
            success_status: Some(204),
            failure_threshold: Some(1),
            ..HealthCheckConfig::default()
        };
        let policy = config.to_policy().expect("policy");
        policy.record_probe(Some(StatusCode::NO_CONTENT));
        assert_eq!(policy.state(), BreakerState::Closed);

        policy.record_probe(Some(StatusCode::OK));
        assert_eq!(policy.state(), BreakerState::Open);
    }
}
