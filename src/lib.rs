//! `httpc` executes outbound HTTP(S) requests with production-grade
//! reliability and observability: retries with backoff and `Retry-After`
//! honoring, per-host circuit breakers, weighted round-robin load
//! balancing, pluggable credential injection, transparent response
//! decompression, and OpenTelemetry spans and metrics that stay consistent
//! across retries.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use httpc::{Client, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! # async fn demo() -> httpc::Result<()> {
//! let client = Client::builder()
//!     .timeout(Duration::from_secs(5))
//!     .retry_policy(
//!         RetryPolicy::standard()
//!             .max_attempts(3)
//!             .base_delay(Duration::from_millis(100)),
//!     )
//!     .build()?;
//!
//! let mut response = client
//!     .get("https://api.example.com/v1/items/42")
//!     .send()
//!     .await?;
//! let item: Item = response.read_json().await?;
//! println!("fetched {}", item.id);
//! # Ok(())
//! # }
//! ```
//!
//! Load-balanced dispatch goes through [`LoadBalancerClient`] backed by a
//! [`WeightedRoundRobin`] balancer over a set of [`Host`]s, each carrying
//! its own headers, credential, and health-check policy.

mod auth;
mod client;
mod core;
mod lb;
mod request;
mod response;

pub(crate) use crate::core::config;
pub(crate) use crate::core::connect;
pub(crate) use crate::core::content_encoding;
pub(crate) use crate::core::error;
pub(crate) use crate::core::execution;
pub(crate) use crate::core::metrics;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::trace;
pub(crate) use crate::core::transport;
pub(crate) use crate::core::util;

pub use crate::auth::{
    AuthConfig, AuthLocation, Authenticator, BasicCredential, EnvGetter, EnvString,
    HttpCredential, OAuth2Credential, TokenLocation, os_env_getter,
};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{
    HttpClientConfig, HttpDialerConfig, HttpRetryConfig, HttpTransportConfig, TlsConfig,
};
pub use crate::connect::ConnectionInfo;
pub use crate::error::{Error, ProblemDetails, TransportErrorKind};
pub use crate::lb::{
    BreakerState, CircuitBreaker, HealthCheckConfig, HealthCheckPolicy, Host, LoadBalancer,
    LoadBalancerClient, WeightedRoundRobin,
};
pub use crate::metrics::{HttpClientMetrics, global_metrics};
pub use crate::request::{
    CustomAttributesFn, HttpClientProvider, HttpDispatcher, Request, RequestOptions,
};
pub use crate::response::Response;
pub use crate::retry::RetryPolicy;
pub use crate::transport::Transport;

pub type Result<T> = std::result::Result<T, Error>;
