use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http_body_util::Full;
use hyper::body::Incoming;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::Result;
use crate::auth::Authenticator;
use crate::error::{Error, ProblemDetails};
use crate::lb::health::{BreakerState, HealthCheckPolicy};
use crate::request::HttpDispatcher;
use crate::transport::Transport;
use crate::util::{join_base_url, validate_http_url};

/// An endpoint participating in load balancing: base URL, weight, custom
/// headers, optional credential, and a health policy gating dispatch.
pub struct Host {
    name: String,
    base_url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    weight: i64,
    current_weight: AtomicI64,
    transport: Transport,
    authenticator: Option<Arc<dyn Authenticator>>,
    health: Option<HealthCheckPolicy>,
    last_http_error_status: AtomicU16,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Host")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Create a host from its base URL. The trailing slash is trimmed and
    /// the name defaults to the URL's authority.
    pub fn new(base_url: impl Into<String>, transport: Transport) -> Result<Self> {
        let raw = base_url.into();
        let parsed = validate_http_url(&raw)?;
        let name = parsed.authority().to_owned();
        Ok(Self {
            name,
            base_url: raw.trim_end_matches('/').to_owned(),
            headers: Vec::new(),
            weight: 1,
            current_weight: AtomicI64::new(0),
            transport,
            authenticator: None,
            health: None,
            last_http_error_status: AtomicU16::new(0),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Load-balancing weight; non-positive values are ignored.
    pub fn with_weight(mut self, weight: i64) -> Self {
        if weight > 0 {
            self.weight = weight;
        }
        self
    }

    /// Custom headers injected into every request to this host.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
            Error::InvalidHeaderName {
                name: name.to_owned(),
                source,
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|source| Error::InvalidHeaderValue {
            name: name.to_string(),
            source,
        })?;
        self.headers.push((name, value));
        Ok(self)
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_health_policy(mut self, policy: HealthCheckPolicy) -> Self {
        self.health = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn weight(&self) -> i64 {
        self.weight
    }

    pub fn health_policy(&self) -> Option<&HealthCheckPolicy> {
        self.health.as_ref()
    }

    /// Circuit breaker state; hosts without a health policy count as
    /// closed.
    pub fn state(&self) -> BreakerState {
        self.health
            .as_ref()
            .map_or(BreakerState::Closed, HealthCheckPolicy::state)
    }

    /// The most recent response status >= 500 seen in-band, and whether it
    /// classifies as a server outage. A gateway timeout may only mean a
    /// slow backend, so 504 is excluded.
    pub fn last_http_error_status(&self) -> (u16, bool) {
        let status = self.last_http_error_status.load(Ordering::Acquire);
        let is_outage = status >= 502 && status != 504;
        (status, is_outage)
    }

    pub(crate) fn add_current_weight(&self) {
        self.current_weight.fetch_add(self.weight, Ordering::AcqRel);
    }

    pub(crate) fn reset_current_weight(&self, total_weight: i64) {
        self.current_weight
            .fetch_sub(total_weight, Ordering::AcqRel);
    }

    pub(crate) fn current_weight(&self) -> i64 {
        self.current_weight.load(Ordering::Acquire)
    }

    pub(crate) fn zero_current_weight(&self) {
        self.current_weight.store(0, Ordering::Release);
    }

    /// Probe the host once and record the outcome on the breaker. A nil
    /// response (transport error or timeout) counts as a failure.
    pub async fn check_health(&self) {
        let Some(policy) = &self.health else {
            return;
        };

        let probe_url = join_base_url(&self.base_url, &policy.path);
        let mut builder = http::Request::builder()
            .method(policy.method.clone())
            .uri(probe_url.as_str());
        for (name, value) in &policy.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = match builder.body(Full::new(policy.body.clone())) {
            Ok(request) => request,
            Err(build_error) => {
                warn!(host = %self.name, error = %build_error, "failed to build health check request");
                policy.record_probe(None);
                return;
            }
        };

        let outcome = tokio::time::timeout(policy.timeout, self.transport.send(request)).await;
        match outcome {
            Ok(Ok(probe_response)) => {
                let status = probe_response.status();
                debug!(host = %self.name, status = status.as_u16(), "health check response");
                policy.record_probe(Some(status));
                drop(probe_response);
            }
            Ok(Err(probe_error)) => {
                debug!(host = %self.name, error = %probe_error, "health check failed");
                policy.record_probe(None);
            }
            Err(_) => {
                debug!(host = %self.name, timeout_ms = policy.timeout.as_millis() as u64, "health check timed out");
                policy.record_probe(None);
            }
        }
    }
}

#[async_trait]
impl HttpDispatcher for Host {
    /// Resolve the URL against the base, inject host headers and the host
    /// credential. When the breaker is open and the last in-band status
    /// classifies as an outage, fail fast without dispatching.
    async fn new_request(
        &self,
        method: &str,
        url: &str,
        body: Full<Bytes>,
    ) -> Result<http::Request<Full<Bytes>>> {
        if let Some(policy) = &self.health
            && policy.state() == BreakerState::Open
        {
            let (status, is_outage) = self.last_http_error_status();
            if is_outage
                && let Ok(status) = http::StatusCode::from_u16(status)
            {
                return Err(Error::problem(ProblemDetails::with_status(status)));
            }
        }

        let target = join_base_url(&self.base_url, url);
        let mut request = http::Request::builder()
            .method(method)
            .uri(target.as_str())
            .body(body)
            .map_err(|source| Error::RequestBuild { source })?;

        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        if let Some(authenticator) = &self.authenticator {
            authenticator.authenticate(&mut request).await?;
        }

        Ok(request)
    }

    /// Dispatch and feed the outcome back into the breaker: status >= 500
    /// records a failure (and the status itself), a transport error with no
    /// response records a failure, anything else records a success.
    async fn send(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<Incoming>> {
        let result = self.transport.send(request).await;

        if let Some(policy) = &self.health {
            match &result {
                Ok(raw_response) if raw_response.status().as_u16() >= 500 => {
                    self.last_http_error_status
                        .store(raw_response.status().as_u16(), Ordering::Release);
                    policy.record_failure();
                }
                Ok(_) => policy.record_success(),
                Err(_) => policy.record_failure(),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::health::HealthCheckConfig;
    use crate::metrics::global_metrics;

    fn transport() -> Transport {
        Transport::build(None, None, global_metrics()).expect("transport")
    }

    #[test]
    fn base_url_is_trimmed_and_name_defaults_to_authority() {
        let host = Host::new("http://10.0.0.1:8080/", transport()).expect("host");
        assert_eq!(host.base_url(), "http://10.0.0.1:8080");
        assert_eq!(host.name(), "10.0.0.1:8080");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(Host::new("not a url", transport()).is_err());
        assert!(Host::new("ftp://files.example.com", transport()).is_err());
    }

    #[test]
    fn outage_classification_excludes_gateway_timeout() {
        let host = Host::new("http://10.0.0.1", transport()).expect("host");

        host.last_http_error_status.store(500, Ordering::Release);
        assert_eq!(host.last_http_error_status(), (500, false));

        host.last_http_error_status.store(502, Ordering::Release);
        assert_eq!(host.last_http_error_status(), (502, true));

        host.last_http_error_status.store(504, Ordering::Release);
        assert_eq!(host.last_http_error_status(), (504, false));

        host.last_http_error_status.store(503, Ordering::Release);
        assert_eq!(host.last_http_error_status(), (503, true));
    }

    #[tokio::test]
    async fn open_breaker_with_outage_short_circuits_new_request() {
        let policy = HealthCheckConfig {
            path: "/healthz".to_owned(),
            failure_threshold: Some(1),
            ..HealthCheckConfig::default()
        }
        .to_policy()
        .expect("policy");

        let host = Host::new("http://10.0.0.1", transport())
            .expect("host")
            .with_health_policy(policy);
        host.last_http_error_status.store(502, Ordering::Release);
        host.health
            .as_ref()
            .expect("health policy")
            .record_failure();
        assert_eq!(host.state(), BreakerState::Open);

        let error = host
            .new_request("GET", "/v1/items", Full::new(Bytes::new()))
            .await
            .expect_err("must short-circuit");
        match error {
            Error::Status(problem) => assert_eq!(problem.status, 502),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn host_headers_are_applied() {
        let host = Host::new("http://10.0.0.1", transport())
            .expect("host")
            .with_header("x-tenant", "acme")
            .expect("header");
        let request = host
            .new_request("GET", "items", Full::new(Bytes::new()))
            .await
            .expect("request");
        assert_eq!(request.uri(), "http://10.0.0.1/items");
        assert_eq!(request.headers()["x-tenant"].to_str().unwrap(), "acme");
    }
}
