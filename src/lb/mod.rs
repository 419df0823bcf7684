//! Client-side load balancing: weighted host selection with circuit-breaker
//! health gating and background probing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::request::{HttpClientProvider, HttpDispatcher, Request, RequestOptions};

pub(crate) mod health;
pub(crate) mod host;
pub(crate) mod round_robin;

pub use health::{BreakerState, CircuitBreaker, HealthCheckConfig, HealthCheckPolicy};
pub use host::Host;
pub use round_robin::WeightedRoundRobin;

/// Load-balancing strategy: pick the host for the next request, keep the
/// host set fresh, and supervise background health probing.
pub trait LoadBalancer: Send + Sync {
    fn next(&self) -> Result<Arc<Host>>;
    fn refresh(&self, hosts: Vec<Arc<Host>>);
    fn hosts(&self) -> Vec<Arc<Host>>;
    fn start_health_check(&self, token: &CancellationToken);
    fn close(&self);
}

/// An HTTP client that spreads requests over a host pool. Each attempt asks
/// the balancer for the next live host, so retried attempts naturally move
/// off unhealthy endpoints.
#[derive(Clone)]
pub struct LoadBalancerClient {
    inner: Arc<LoadBalancerClientInner>,
}

struct LoadBalancerClientInner {
    balancer: Arc<dyn LoadBalancer>,
    options: RequestOptions,
}

impl LoadBalancerClient {
    pub fn new(balancer: Arc<dyn LoadBalancer>, options: RequestOptions) -> Self {
        Self {
            inner: Arc::new(LoadBalancerClientInner { balancer, options }),
        }
    }

    /// Create a request bound to this client; the target URL is resolved
    /// against the selected host's base URL per attempt.
    pub fn request(&self, method: impl Into<String>, url: impl Into<String>) -> Request {
        Request::new(method, url, Arc::new(self.clone()))
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.inner.balancer
    }

    pub fn start_health_check(&self, token: &CancellationToken) {
        self.inner.balancer.start_health_check(token);
    }

    pub fn close(&self) {
        self.inner.balancer.close();
    }
}

impl std::fmt::Debug for LoadBalancerClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LoadBalancerClient")
            .field("hosts", &self.inner.balancer.hosts().len())
            .finish_non_exhaustive()
    }
}

impl HttpClientProvider for LoadBalancerClient {
    fn dispatcher(&self) -> Result<Arc<dyn HttpDispatcher>> {
        let host = self.inner.balancer.next()?;
        Ok(host)
    }

    fn request_options(&self) -> &RequestOptions {
        &self.inner.options
    }
}
