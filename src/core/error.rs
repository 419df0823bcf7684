use std::collections::BTreeMap;

use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::telemetry_headers;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of transport-level failures, used for retry
/// decisions and the `error.type` metric attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request method is required")]
    RequestMethodRequired,
    #[error("request was already executed")]
    RequestAlreadyExecuted,
    #[error("response body has no content")]
    BodyNoContent,
    #[error("response body was already read")]
    BodyAlreadyRead,
    #[error("response body was read after close")]
    BodyReadAfterClose,
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("auth credential is empty")]
    AuthCredentialEmpty,
    #[error("invalid auth configuration: {message}")]
    AuthConfig { message: String },
    #[error("failed to fetch oauth2 token: {message}")]
    TokenExchange { message: String },
    #[error("invalid health check method. Expects one of GET or POST")]
    InvalidHealthCheckMethod,
    #[error("invalid status of HTTP health check. Expects one of 200, 201 or 204")]
    InvalidHealthCheckSuccessStatus,
    #[error("threshold of HTTP health check must be positive")]
    InvalidHealthCheckThreshold,
    #[error("invalid retry configuration: {message}")]
    RetryConfig { message: String },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("no active host")]
    NoActiveHost,
    #[error("http transport error ({kind}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u128 },
    #[error("request was canceled")]
    Canceled,
    #[error("failed to read request body: {source}")]
    ReadRequestBody {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compress request body with {encoding}: {message}")]
    Compress { encoding: String, message: String },
    #[error("failed to decompress response body with {encoding}: {message}")]
    Decompress { encoding: String, message: String },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("failed to serialize request json: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode response json: {source}")]
    DecodeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Status(#[from] Box<ProblemDetails>),
}

impl Error {
    /// Failure signatures that must never be retried regardless of policy.
    pub(crate) fn is_non_retryable(&self) -> bool {
        match self {
            Self::InvalidUrl { .. }
            | Self::RequestBuild { .. }
            | Self::InvalidHeaderName { .. }
            | Self::InvalidHeaderValue { .. }
            | Self::AuthCredentialEmpty
            | Self::AuthConfig { .. }
            | Self::RequestMethodRequired
            | Self::RequestAlreadyExecuted
            | Self::Timeout { .. }
            | Self::Canceled => true,
            Self::Transport { kind, .. } => *kind == TransportErrorKind::Tls,
            _ => false,
        }
    }

    pub(crate) fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status(problem) => StatusCode::from_u16(problem.status).ok(),
            _ => None,
        }
    }

    pub(crate) fn problem(problem: ProblemDetails) -> Self {
        Self::Status(Box::new(problem))
    }
}

/// RFC 9457 problem details with a free-form extensions map.
///
/// Responses with status >= 400 are surfaced as this structure; JSON bodies
/// are decoded into it, other bodies land in `detail`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_uri: Option<String>,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl std::fmt::Display for ProblemDetails {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} {}", self.status, self.title)?;
        if let Some(detail) = &self.detail
            && !detail.is_empty()
        {
            write!(formatter, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProblemDetails {}

fn status_title(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

fn headers_extension(headers: &HeaderMap) -> serde_json::Value {
    let captured = telemetry_headers(headers, None);
    serde_json::Value::Object(
        captured
            .into_iter()
            .map(|(name, value)| (name, serde_json::Value::String(value)))
            .collect(),
    )
}

impl ProblemDetails {
    /// Minimal problem value carrying only a status, used when a
    /// circuit-broken host short-circuits dispatch.
    pub(crate) fn with_status(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            title: status_title(status),
            ..Self::default()
        }
    }

    pub(crate) fn from_no_content_response(status: StatusCode, headers: &HeaderMap) -> Self {
        let mut problem = Self::with_status(status);
        problem
            .extensions
            .insert("headers".to_owned(), headers_extension(headers));
        problem
    }

    /// Build the error value for a response with status >= 400 whose body
    /// has already been read (and decompressed) into `body`.
    pub(crate) fn from_response(
        status: StatusCode,
        headers: &HeaderMap,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Self {
        if body.is_empty() {
            return Self::from_no_content_response(status, headers);
        }

        if content_type.is_some_and(|value| value.starts_with("application/json"))
            && let Ok(mut problem) = serde_json::from_slice::<Self>(body)
        {
            if problem.status == 0 {
                problem.status = status.as_u16();
            }
            if problem.title.is_empty() {
                problem.title = status_title(status);
            }
            problem
                .extensions
                .insert("headers".to_owned(), headers_extension(headers));
            return problem;
        }

        let mut problem = Self::from_no_content_response(status, headers);
        problem.detail = Some(String::from_utf8_lossy(body).into_owned());
        problem
    }
}
