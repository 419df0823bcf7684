use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};
use rand::Rng;

use crate::error::Error;
use crate::util::parse_retry_after;

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429_u16, 500, 502, 503, 504].into_iter().collect()
}

/// Retry policy for a request: how many additional attempts to make, which
/// outcomes qualify, and how long to wait between attempts.
///
/// The delay grows exponentially from `base_delay` by `multiplier` up to
/// `max_delay`; when `max_delay <= base_delay` the delay is constant. A
/// server-provided `Retry-After` header always wins over the computed
/// backoff.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Option<Duration>,
    jitter_factor: Option<f64>,
    retryable_statuses: BTreeSet<u16>,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: None,
            jitter_factor: Some(0.2),
            retryable_statuses: default_retryable_status_codes(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Growth factor for subsequent delays; values below 1 are clamped to 1.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Absolute jitter: the delay is sampled uniformly from
    /// `delay ± jitter`. Takes precedence over `jitter_factor`.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Relative jitter in `[0, 1]`: the delay is sampled uniformly from
    /// `delay ± factor * delay`.
    pub fn jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = Some(jitter_factor.clamp(0.0, 1.0));
        self
    }

    pub fn retryable_statuses(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = codes.into_iter().collect();
        self
    }

    pub(crate) fn max_attempts_value(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether the `(status, error)` pair of the last attempt
    /// qualifies for another try.
    pub(crate) fn should_retry(&self, status: Option<StatusCode>, error: Option<&Error>) -> bool {
        if let Some(error) = error {
            if error.is_non_retryable() {
                return false;
            }
            if status.is_none() {
                return true;
            }
        }

        let Some(status) = status else {
            return false;
        };
        let code = status.as_u16();

        if self.retryable_statuses.contains(&code) {
            return true;
        }
        if code == 429 {
            return true;
        }
        (500..=599).contains(&code) && code != 501
    }

    /// Compute the wait before retry number `retry_index` (zero-based),
    /// honoring the response's `Retry-After` header when present.
    pub(crate) fn delay(&self, retry_index: u32, response_headers: Option<&HeaderMap>) -> Duration {
        if let Some(headers) = response_headers
            && let Some(retry_after) = parse_retry_after(headers, SystemTime::now())
        {
            return retry_after;
        }

        let backoff = if self.max_delay <= self.base_delay {
            self.base_delay
        } else {
            let exponent = retry_index.min(63);
            let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
            Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
        };

        self.apply_jitter(backoff)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        let span_ms = if let Some(jitter) = self.jitter {
            jitter.as_millis().min(u64::MAX as u128) as u64
        } else if let Some(factor) = self.jitter_factor {
            (backoff.as_millis() as f64 * factor).round() as u64
        } else {
            0
        };
        if span_ms == 0 {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        let low = backoff_ms.saturating_sub(span_ms);
        let high = backoff_ms.saturating_add(span_ms).max(low);
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(low..=high))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;

    fn policy() -> RetryPolicy {
        RetryPolicy::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(800))
            .multiplier(2.0)
            .jitter_factor(0.0)
    }

    #[test]
    fn transport_errors_retry() {
        let error = Error::Transport {
            kind: TransportErrorKind::Connect,
            source: "connection refused".into(),
        };
        assert!(policy().should_retry(None, Some(&error)));
    }

    #[test]
    fn canceled_and_deadline_never_retry() {
        assert!(!policy().should_retry(None, Some(&Error::Canceled)));
        assert!(!policy().should_retry(None, Some(&Error::Timeout { timeout_ms: 10 })));
    }

    #[test]
    fn status_decision_order() {
        let policy = policy().retryable_statuses([418_u16]);
        assert!(policy.should_retry(Some(StatusCode::IM_A_TEAPOT), None));
        assert!(policy.should_retry(Some(StatusCode::TOO_MANY_REQUESTS), None));
        assert!(policy.should_retry(Some(StatusCode::INTERNAL_SERVER_ERROR), None));
        assert!(!policy.should_retry(Some(StatusCode::NOT_IMPLEMENTED), None));
        assert!(!policy.should_retry(Some(StatusCode::BAD_REQUEST), None));
        assert!(!policy.should_retry(Some(StatusCode::OK), None));
    }

    #[test]
    fn exponential_backoff_with_cap() {
        let policy = policy();
        assert_eq!(policy.delay(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay(2, None), Duration::from_millis(400));
        assert_eq!(policy.delay(5, None), Duration::from_millis(800));
    }

    #[test]
    fn constant_delay_when_max_not_above_base() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(50))
            .jitter_factor(0.0);
        assert_eq!(policy.delay(4, None), Duration::from_millis(50));
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "2".parse().expect("header value"));
        let delay = policy().delay(0, Some(&headers));
        assert!(delay >= Duration::from_secs(2));
    }

    #[test]
    fn absolute_jitter_bounds() {
        let policy = RetryPolicy::standard()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(100))
            .jitter(Duration::from_millis(30));
        for _ in 0..50 {
            let delay = policy.delay(0, None);
            assert!(delay >= Duration::from_millis(70));
            assert!(delay <= Duration::from_millis(130));
        }
    }
}
