use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::error::Error;
use crate::retry::RetryPolicy;

/// Declarative client configuration, deserializable from JSON or YAML.
/// Durations are expressed in milliseconds unless noted otherwise.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpClientConfig {
    /// Overall request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<HttpTransportConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<HttpRetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTransportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialer: Option<HttpDialerConfig>,
    /// How long an idle pooled connection may linger, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_conn_timeout: Option<u64>,
    /// Time to wait for response headers after the request is written,
    /// in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_handshake_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_continue_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_conns: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_conns_per_host: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conns_per_host: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_header_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_buffer_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_buffer_size: Option<usize>,
    #[serde(default)]
    pub disable_keep_alives: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDialerConfig {
    /// Maximum time a dial waits for a connect to complete, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// TCP keep-alive probes are enabled unless set to `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_enabled: Option<bool>,
    /// Interval between keep-alive probes, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval: Option<u64>,
    /// Unanswered probes tolerated before the connection is dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_count: Option<u32>,
    /// Idle time before the first keep-alive probe, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_idle: Option<u64>,
    /// Wait before spawning an RFC 6555 fallback connection, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_delay: Option<u64>,
}

/// TLS material is referenced by path; loading happens once at transport
/// build time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRetryConfig {
    /// Maximum number of retry attempts. Defaults to 0 (no retry).
    #[serde(default)]
    pub max_attempts: u32,
    /// Initial interval used to compute the next retry, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Upper bound on the computed delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,
    /// Retry when the remote service returns one of these statuses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_status: Vec<u16>,
    /// Growth factor for subsequent delays. Must be >= 1 when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Absolute jitter applied to each delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<u64>,
    /// Relative jitter in `[0, 1]`, applied when `jitter` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,
}

impl HttpRetryConfig {
    pub fn to_policy(&self) -> Result<RetryPolicy, Error> {
        if let Some(multiplier) = self.multiplier
            && multiplier < 1.0
        {
            return Err(Error::RetryConfig {
                message: format!("multiplier must be >= 1; got {multiplier}"),
            });
        }
        if let Some(factor) = self.jitter_factor
            && !(0.0..=1.0).contains(&factor)
        {
            return Err(Error::RetryConfig {
                message: format!("jitterFactor must be in [0, 1]; got {factor}"),
            });
        }
        if let Some(status) = self
            .http_status
            .iter()
            .find(|status| !(400..=599).contains(*status))
        {
            return Err(Error::RetryConfig {
                message: format!("httpStatus entries must be in [400, 599]; got {status}"),
            });
        }

        let mut policy = RetryPolicy::standard().max_attempts(self.max_attempts);
        if let Some(delay) = self.delay {
            policy = policy.base_delay(Duration::from_millis(delay));
        }
        if let Some(max_delay) = self.max_delay {
            policy = policy.max_delay(Duration::from_millis(max_delay));
        }
        if !self.http_status.is_empty() {
            policy = policy.retryable_statuses(self.http_status.iter().copied());
        }
        if let Some(multiplier) = self.multiplier {
            policy = policy.multiplier(multiplier);
        }
        if let Some(jitter) = self.jitter {
            policy = policy.jitter(Duration::from_millis(jitter));
        } else if let Some(factor) = self.jitter_factor {
            policy = policy.jitter_factor(factor);
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_rejects_bad_multiplier() {
        let config = HttpRetryConfig {
            multiplier: Some(0.5),
            ..HttpRetryConfig::default()
        };
        assert!(matches!(
            config.to_policy(),
            Err(Error::RetryConfig { .. })
        ));
    }

    #[test]
    fn retry_config_rejects_out_of_range_status() {
        let config = HttpRetryConfig {
            http_status: vec![302],
            ..HttpRetryConfig::default()
        };
        assert!(config.to_policy().is_err());
    }

    #[test]
    fn client_config_deserializes_from_yaml_with_auth_dispatch() {
        let raw = r#"
timeout: 3000
retry:
  maxAttempts: 3
  delay: 250
  multiplier: 1.5
  jitterFactor: 0.4
authentication:
  type: oauth2
  tokenUrl: https://idp.example.com/token
  clientId: cid
  clientSecret:
    env: OAUTH_SECRET
  scopes: [read]
"#;
        let config: HttpClientConfig = serde_yaml::from_str(raw).expect("yaml config");
        assert_eq!(config.timeout, Some(3000));
        assert!(matches!(
            config.authentication,
            Some(AuthConfig::OAuth2(_))
        ));
        assert!(config.retry.expect("retry").to_policy().is_ok());
    }

    #[test]
    fn client_config_deserializes_from_json() {
        let raw = r#"{
            "timeout": 5000,
            "retry": {"maxAttempts": 2, "delay": 100, "httpStatus": [429, 503]},
            "transport": {"idleConnTimeout": 60000, "dialer": {"timeout": 2000}}
        }"#;
        let config: HttpClientConfig = serde_json::from_str(raw).expect("json config");
        assert_eq!(config.timeout, Some(5000));
        let retry = config.retry.expect("retry section");
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.http_status, vec![429, 503]);
        let transport = config.transport.expect("transport section");
        assert_eq!(transport.idle_conn_timeout, Some(60_000));
        assert_eq!(transport.dialer.expect("dialer").timeout, Some(2000));
    }
}
