use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsConnector;

use crate::config::{HttpDialerConfig, HttpTransportConfig, TlsConfig};
use crate::connect::{ConnectError, HostConnLimits, KeepaliveSettings, MeteredConnector};
use crate::error::{Error, TransportErrorKind};
use crate::metrics::HttpClientMetrics;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn default_max_idle_conns_per_host() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        + 1
}

fn tls_config_error(message: impl std::fmt::Display) -> Error {
    Error::TlsConfig {
        message: message.to_string(),
    }
}

fn build_tls_connector(config: Option<&TlsConfig>) -> Result<TlsConnector, Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = config.and_then(|tls| tls.ca_file.as_deref()) {
        let certificates = CertificateDer::pem_file_iter(ca_file)
            .map_err(|error| tls_config_error(format!("failed to read {ca_file}: {error}")))?;
        for certificate in certificates {
            let certificate = certificate
                .map_err(|error| tls_config_error(format!("invalid PEM in {ca_file}: {error}")))?;
            roots.add(certificate).map_err(|error| {
                tls_config_error(format!("rejected root certificate in {ca_file}: {error}"))
            })?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let mut client_config = match (
        config.and_then(|tls| tls.cert_file.as_deref()),
        config.and_then(|tls| tls.key_file.as_deref()),
    ) {
        (Some(cert_file), Some(key_file)) => {
            let certificates = CertificateDer::pem_file_iter(cert_file)
                .map_err(|error| tls_config_error(format!("failed to read {cert_file}: {error}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|error| tls_config_error(format!("invalid PEM in {cert_file}: {error}")))?;
            let key = PrivateKeyDer::from_pem_file(key_file)
                .map_err(|error| tls_config_error(format!("failed to read {key_file}: {error}")))?;
            builder
                .with_client_auth_cert(certificates, key)
                .map_err(|error| tls_config_error(format!("invalid client identity: {error}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(tls_config_error(
                "certFile and keyFile must be provided together",
            ));
        }
    };
    client_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn keepalive_settings(dialer: Option<&HttpDialerConfig>) -> Option<KeepaliveSettings> {
    let enabled = dialer
        .and_then(|config| config.keep_alive_enabled)
        .unwrap_or(true);
    if !enabled {
        return None;
    }
    Some(KeepaliveSettings {
        idle: dialer
            .and_then(|config| config.keep_alive_idle)
            .map(Duration::from_millis),
        interval: Some(
            dialer
                .and_then(|config| config.keep_alive_interval)
                .map_or(DEFAULT_KEEPALIVE_INTERVAL, Duration::from_millis),
        ),
        count: dialer.and_then(|config| config.keep_alive_count),
    })
}

/// Connection-pooling transport shared by clients and hosts.
///
/// Built once per client; cloning shares the pool. Every overridden
/// configuration field replaces the corresponding default, zero-valued
/// optional integers fall back to defaults.
#[derive(Clone)]
pub struct Transport {
    client: HyperClient<MeteredConnector, Full<Bytes>>,
    response_header_timeout: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Transport")
            .field("response_header_timeout", &self.response_header_timeout)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn build(
        config: Option<&HttpTransportConfig>,
        tls: Option<&TlsConfig>,
        metrics: Arc<HttpClientMetrics>,
    ) -> Result<Self, Error> {
        let dialer = config.and_then(|transport| transport.dialer.as_ref());

        let dial_timeout = dialer
            .and_then(|dialer| dialer.timeout)
            .map_or(DEFAULT_DIAL_TIMEOUT, Duration::from_millis);
        let tls_handshake_timeout = config
            .and_then(|transport| transport.tls_handshake_timeout)
            .map_or(DEFAULT_TLS_HANDSHAKE_TIMEOUT, Duration::from_millis);
        let host_limits = config
            .and_then(|transport| transport.max_conns_per_host)
            .filter(|max| *max > 0)
            .map(|max| Arc::new(HostConnLimits::new(max)));

        let connector = MeteredConnector::new(
            build_tls_connector(tls)?,
            metrics,
            dial_timeout,
            tls_handshake_timeout,
            keepalive_settings(dialer),
            host_limits,
        );

        let idle_timeout = config
            .and_then(|transport| transport.idle_conn_timeout)
            .map_or(DEFAULT_IDLE_CONN_TIMEOUT, Duration::from_millis);
        let max_idle_per_host = if config.is_some_and(|transport| transport.disable_keep_alives) {
            0
        } else {
            config
                .and_then(|transport| transport.max_idle_conns_per_host)
                .filter(|max| *max > 0)
                .unwrap_or_else(default_max_idle_conns_per_host)
        };

        let mut builder = HyperClient::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(max_idle_per_host);
        if let Some(size) = config
            .and_then(|transport| transport.read_buffer_size)
            .filter(|size| *size > 0)
        {
            builder.http1_max_buf_size(size);
        }

        Ok(Self {
            client: builder.build(connector),
            response_header_timeout: config
                .and_then(|transport| transport.response_header_timeout)
                .map_or(DEFAULT_RESPONSE_HEADER_TIMEOUT, Duration::from_millis),
        })
    }

    /// Dispatch one request. Resolves when response headers arrive; the
    /// body streams afterwards.
    pub(crate) async fn send(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<Incoming>, Error> {
        let dispatch = self.client.request(request);
        match tokio::time::timeout(self.response_header_timeout, dispatch).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(map_transport_error(error)),
            // A header wait expiring is a per-attempt transport failure,
            // unlike the request's overall deadline.
            Err(_) => Err(Error::Transport {
                kind: TransportErrorKind::Read,
                source: format!(
                    "timed out awaiting response headers after {}ms",
                    self.response_header_timeout.as_millis()
                )
                .into(),
            }),
        }
    }
}

/// Map a pooled-client failure onto the transport error taxonomy by
/// scanning the source chain for the connector's own error type.
pub(crate) fn map_transport_error(error: hyper_util::client::legacy::Error) -> Error {
    let kind = {
        let mut kind = TransportErrorKind::Other;
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(&error);
        while let Some(current) = cause {
            if let Some(connect_error) = current.downcast_ref::<ConnectError>() {
                kind = connect_error.kind();
                break;
            }
            if let Some(hyper_error) = current.downcast_ref::<hyper::Error>()
                && (hyper_error.is_incomplete_message() || hyper_error.is_body_write_aborted())
            {
                kind = TransportErrorKind::Read;
            }
            cause = current.source();
        }
        kind
    };

    Error::Transport {
        kind,
        source: Box::new(error),
    }
}
