use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http_body_util::Full;
use hyper::body::Incoming;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::Result;
use crate::auth::Authenticator;
use crate::error::Error;
use crate::execution;
use crate::metrics::{HttpClientMetrics, global_metrics};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::util::build_version;

/// The dispatcher capability consumed by the executor: build an underlying
/// request, then send it. Supplied by a direct [`crate::Client`] or by a
/// [`crate::lb::Host`] picked from a load balancer.
#[async_trait]
pub trait HttpDispatcher: Send + Sync {
    async fn new_request(
        &self,
        method: &str,
        url: &str,
        body: Full<Bytes>,
    ) -> Result<http::Request<Full<Bytes>>>;

    async fn send(&self, request: http::Request<Full<Bytes>>)
    -> Result<http::Response<Incoming>>;
}

/// Anything that can hand the executor a dispatcher per attempt: the direct
/// client returns itself, the load-balancer client returns its next live
/// host.
pub trait HttpClientProvider: Send + Sync {
    fn dispatcher(&self) -> Result<Arc<dyn HttpDispatcher>>;
    fn request_options(&self) -> &RequestOptions;
}

/// Hook to append caller-defined attributes to the request span and the
/// duration metric.
pub type CustomAttributesFn = Arc<dyn Fn(&Request) -> Vec<KeyValue> + Send + Sync>;

/// Options shared by every request issued through a client; each request
/// may override the retry policy, timeout, and authenticator.
#[derive(Clone)]
pub struct RequestOptions {
    pub(crate) metrics: Arc<HttpClientMetrics>,
    pub(crate) trace_high_cardinality_path: bool,
    pub(crate) metric_high_cardinality_path: bool,
    pub(crate) custom_attributes: Option<CustomAttributesFn>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) detailed_trace: bool,
    pub(crate) user_agent: String,
    pub(crate) allowed_trace_request_headers: Option<Vec<String>>,
    pub(crate) allowed_trace_response_headers: Option<Vec<String>>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            metrics: global_metrics(),
            trace_high_cardinality_path: false,
            metric_high_cardinality_path: false,
            custom_attributes: None,
            retry: None,
            timeout: None,
            authenticator: None,
            detailed_trace: std::env::var("HTTP_CLIENT_TRACE_ENABLED").as_deref() == Ok("true"),
            user_agent: format!("httpc/{}", build_version()),
            allowed_trace_request_headers: None,
            allowed_trace_response_headers: None,
        }
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestOptions")
            .field("detailed_trace", &self.detailed_trace)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<HttpClientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Capture fine-grained connection lifecycle timings and the
    /// `http.stats.*` span attributes on every attempt.
    pub fn with_detailed_trace(mut self, enabled: bool) -> Self {
        self.detailed_trace = enabled;
        self
    }

    pub fn with_trace_high_cardinality_path(mut self, enabled: bool) -> Self {
        self.trace_high_cardinality_path = enabled;
        self
    }

    pub fn with_metric_high_cardinality_path(mut self, enabled: bool) -> Self {
        self.metric_high_cardinality_path = enabled;
        self
    }

    pub fn with_custom_attributes(mut self, hook: CustomAttributesFn) -> Self {
        self.custom_attributes = Some(hook);
        self
    }

    /// Restrict which request headers reach logs and spans. A missing list
    /// allows all headers; an empty list allows none.
    pub fn allow_trace_request_headers(mut self, names: Vec<String>) -> Self {
        self.allowed_trace_request_headers = Some(names);
        self
    }

    pub fn allow_trace_response_headers(mut self, names: Vec<String>) -> Self {
        self.allowed_trace_response_headers = Some(names);
        self
    }
}

pub(crate) enum RequestBody {
    Bytes(Bytes),
    Stream(Pin<Box<dyn AsyncRead + Send + Sync>>),
}

/// A single logical HTTP request: mutable until `send` is invoked,
/// logically immutable during an in-flight attempt.
pub struct Request {
    pub(crate) method: String,
    pub(crate) url: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<RequestBody>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) provider: Arc<dyn HttpClientProvider>,
}

impl Request {
    pub(crate) fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        provider: Arc<dyn HttpClientProvider>,
    ) -> Self {
        let options = provider.request_options();
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: options.timeout,
            retry: options.retry.clone(),
            authenticator: None,
            provider,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
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
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Request-scoped credential override; wins over the client default.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    /// Streaming request body. The executor reads it fully once so retried
    /// attempts replay the same bytes.
    pub fn body_reader(mut self, reader: impl AsyncRead + Send + Sync + 'static) -> Self {
        self.body = Some(RequestBody::Stream(Box::pin(reader)));
        self
    }

    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(value).map_err(|source| Error::Serialize { source })?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(RequestBody::Bytes(Bytes::from(encoded)));
        Ok(self)
    }

    /// Independent deep copy; `None` when the body is a non-replayable
    /// stream.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            None => None,
            Some(RequestBody::Bytes(bytes)) => Some(RequestBody::Bytes(bytes.clone())),
            Some(RequestBody::Stream(_)) => return None,
        };
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
            timeout: self.timeout,
            retry: self.retry.clone(),
            authenticator: self.authenticator.clone(),
            provider: self.provider.clone(),
        })
    }

    /// Execute the request: compression, timeout, the retry loop, and
    /// per-attempt dispatch through the provider's dispatcher.
    pub async fn send(self) -> Result<Response> {
        let provider = self.provider.clone();
        execution::execute(self, provider).await
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
