use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;

use crate::Result;
use crate::auth::{Authenticator, EnvGetter};
use crate::config::{HttpClientConfig, HttpTransportConfig, TlsConfig};
use crate::error::Error;
use crate::request::{HttpClientProvider, HttpDispatcher, Request, RequestOptions};
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use crate::util::validate_http_url;

struct ClientInner {
    transport: Transport,
    options: RequestOptions,
}

/// Direct HTTP client: dispatches requests to absolute URLs over a shared
/// pooled transport. Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Build a client from the declarative configuration surface,
    /// resolving env-backed credential fields through `env`.
    pub fn from_config(config: &HttpClientConfig, env: &EnvGetter) -> Result<Self> {
        let mut builder = ClientBuilder::new();
        if let Some(transport) = &config.transport {
            builder = builder.transport_config(transport.clone());
        }
        if let Some(tls) = &config.tls {
            builder = builder.tls_config(tls.clone());
        }
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(Duration::from_millis(timeout));
        }
        if let Some(retry) = &config.retry {
            builder = builder.retry_policy(retry.to_policy()?);
        }
        if let Some(authentication) = &config.authentication {
            builder = builder.authenticator(authentication.build(env)?);
        }
        builder.build()
    }

    /// Create a request bound to this client with its default options.
    pub fn request(&self, method: impl Into<String>, url: impl Into<String>) -> Request {
        Request::new(method, url, Arc::new(self.clone()))
    }

    pub fn get(&self, url: impl Into<String>) -> Request {
        self.request("GET", url)
    }

    pub fn post(&self, url: impl Into<String>) -> Request {
        self.request("POST", url)
    }

    pub fn put(&self, url: impl Into<String>) -> Request {
        self.request("PUT", url)
    }

    pub fn patch(&self, url: impl Into<String>) -> Request {
        self.request("PATCH", url)
    }

    pub fn delete(&self, url: impl Into<String>) -> Request {
        self.request("DELETE", url)
    }

    pub fn head(&self, url: impl Into<String>) -> Request {
        self.request("HEAD", url)
    }

    pub fn options(&self) -> &RequestOptions {
        &self.inner.options
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.inner.transport
    }
}

impl HttpClientProvider for Client {
    fn dispatcher(&self) -> Result<Arc<dyn HttpDispatcher>> {
        Ok(self.inner.clone())
    }

    fn request_options(&self) -> &RequestOptions {
        &self.inner.options
    }
}

#[async_trait]
impl HttpDispatcher for ClientInner {
    async fn new_request(
        &self,
        method: &str,
        url: &str,
        body: Full<Bytes>,
    ) -> Result<http::Request<Full<Bytes>>> {
        // The direct client has no base URL to resolve against.
        validate_http_url(url)?;
        http::Request::builder()
            .method(method)
            .uri(url)
            .body(body)
            .map_err(|source| Error::RequestBuild { source })
    }

    async fn send(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<Incoming>> {
        self.transport.send(request).await
    }
}

/// Builder for [`Client`], carrying both transport wiring and the default
/// request options.
#[derive(Default)]
pub struct ClientBuilder {
    transport_config: Option<HttpTransportConfig>,
    tls_config: Option<TlsConfig>,
    options: RequestOptions,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            transport_config: None,
            tls_config: None,
            options: RequestOptions::default(),
        }
    }

    pub fn transport_config(mut self, config: HttpTransportConfig) -> Self {
        self.transport_config = Some(config);
        self
    }

    pub fn tls_config(mut self, config: TlsConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.options = self.options.with_retry(retry);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.options = self.options.with_authenticator(authenticator);
        self
    }

    /// Replace the default request options wholesale; the transport
    /// settings above still apply.
    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.options = self.options.with_user_agent(user_agent);
        self
    }

    pub fn detailed_trace(mut self, enabled: bool) -> Self {
        self.options = self.options.with_detailed_trace(enabled);
        self
    }

    pub fn build(self) -> Result<Client> {
        let transport = Transport::build(
            self.transport_config.as_ref(),
            self.tls_config.as_ref(),
            self.options.metrics.clone(),
        )?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                options: self.options,
            }),
        })
    }
}
