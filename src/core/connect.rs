use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use opentelemetry::KeyValue;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::error::{BoxError, TransportErrorKind};
use crate::metrics::HttpClientMetrics;
use crate::util::{default_port, lock_unpoisoned};

/// Classify a DNS resolution failure for the `error.type` metric attribute.
/// Not-found wins over timeout; everything else is `_OTHER`.
pub(crate) fn classify_dns_error(error: &io::Error) -> &'static str {
    if error.kind() == io::ErrorKind::NotFound
        || error.to_string().contains("failed to lookup address")
    {
        return "host_not_found";
    }
    if error.kind() == io::ErrorKind::TimedOut {
        return "timeout";
    }
    "_OTHER"
}

/// TCP keep-alive knobs applied to every new connection.
#[derive(Clone, Debug)]
pub(crate) struct KeepaliveSettings {
    pub(crate) idle: Option<Duration>,
    pub(crate) interval: Option<Duration>,
    pub(crate) count: Option<u32>,
}

impl KeepaliveSettings {
    fn to_tcp_keepalive(&self) -> TcpKeepalive {
        let mut keepalive = TcpKeepalive::new();
        if let Some(idle) = self.idle {
            keepalive = keepalive.with_time(idle);
        }
        if let Some(interval) = self.interval {
            keepalive = keepalive.with_interval(interval);
        }
        if let Some(count) = self.count {
            keepalive = keepalive.with_retries(count);
        }
        keepalive
    }
}

/// Dial observation attached to every established connection. It travels
/// into the response extensions of each request served over the connection,
/// so the attempt tracer sees exact per-request connection facts.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    inner: Arc<ConnectionInfoInner>,
}

#[derive(Debug)]
struct ConnectionInfoInner {
    remote_addr: SocketAddr,
    dns_lookup: Option<Duration>,
    tcp_connect: Duration,
    tls_handshake: Option<Duration>,
    established_at: Instant,
    used: AtomicBool,
    last_used_at: Mutex<Instant>,
}

/// Per-request view of the connection derived at observation time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnectionUse {
    pub(crate) reused: bool,
    pub(crate) idle_for: Duration,
}

impl ConnectionInfo {
    fn new(
        remote_addr: SocketAddr,
        dns_lookup: Option<Duration>,
        tcp_connect: Duration,
        tls_handshake: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(ConnectionInfoInner {
                remote_addr,
                dns_lookup,
                tcp_connect,
                tls_handshake,
                established_at: now,
                used: AtomicBool::new(false),
                last_used_at: Mutex::new(now),
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub(crate) fn dns_lookup(&self) -> Option<Duration> {
        self.inner.dns_lookup
    }

    pub(crate) fn tcp_connect(&self) -> Duration {
        self.inner.tcp_connect
    }

    pub(crate) fn tls_handshake(&self) -> Option<Duration> {
        self.inner.tls_handshake
    }

    pub(crate) fn established_at(&self) -> Instant {
        self.inner.established_at
    }

    /// Mark the connection as serving one more request. The first caller
    /// observes a fresh dial; later callers observe reuse along with the
    /// time the connection sat idle since its previous request.
    pub(crate) fn mark_used(&self) -> ConnectionUse {
        let reused = self.inner.used.swap(true, Ordering::AcqRel);
        let mut last_used_at = lock_unpoisoned(&self.inner.last_used_at);
        let idle_for = if reused {
            last_used_at.elapsed()
        } else {
            Duration::ZERO
        };
        *last_used_at = Instant::now();
        ConnectionUse { reused, idle_for }
    }
}

#[derive(Debug)]
pub(crate) struct ConnectError {
    kind: TransportErrorKind,
    message: String,
    source: Option<BoxError>,
}

impl ConnectError {
    fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    fn with_source(
        kind: TransportErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(formatter, "{}: {source}", self.message),
            None => formatter.write_str(&self.message),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

/// Enforces `maxConnsPerHost`: a permit is acquired before dialing and held
/// for the connection's whole lifetime, so dials block at the limit.
#[derive(Debug)]
pub(crate) struct HostConnLimits {
    max: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostConnLimits {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, key: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut semaphores = lock_unpoisoned(&self.semaphores);
            semaphores
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max)))
                .clone()
        };
        semaphore.acquire_owned().await.ok()
    }
}

/// Connection-pooling transport connector: resolves, connects, and
/// handshakes itself so each phase can be timed, classified, and surfaced
/// through metrics and the per-attempt tracer.
#[derive(Clone)]
pub(crate) struct MeteredConnector {
    tls: TlsConnector,
    metrics: Arc<HttpClientMetrics>,
    dial_timeout: Duration,
    tls_handshake_timeout: Duration,
    keepalive: Option<KeepaliveSettings>,
    host_limits: Option<Arc<HostConnLimits>>,
}

impl MeteredConnector {
    pub(crate) fn new(
        tls: TlsConnector,
        metrics: Arc<HttpClientMetrics>,
        dial_timeout: Duration,
        tls_handshake_timeout: Duration,
        keepalive: Option<KeepaliveSettings>,
        host_limits: Option<Arc<HostConnLimits>>,
    ) -> Self {
        Self {
            tls,
            metrics,
            dial_timeout,
            tls_handshake_timeout,
            keepalive,
            host_limits,
        }
    }

    async fn connect(self, uri: Uri) -> Result<MeteredIo, ConnectError> {
        let scheme = uri.scheme_str().unwrap_or_default().to_ascii_lowercase();
        let use_tls = match scheme.as_str() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ConnectError::new(
                    TransportErrorKind::Other,
                    format!("unsupported protocol scheme {other:?}"),
                ));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| ConnectError::new(TransportErrorKind::Other, "uri has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = default_port(Some(scheme.as_str()), uri.port_u16()).unwrap_or(80);

        let permit = match &self.host_limits {
            Some(limits) => limits.acquire(&format!("{host}:{port}")).await,
            None => None,
        };

        let (addresses, dns_lookup) = self.resolve(&host, port).await?;
        let (stream, tcp_connect) = self.dial_tcp(&host, &addresses).await?;
        let remote_addr = stream.peer_addr().map_err(|error| {
            ConnectError::with_source(TransportErrorKind::Connect, "failed to read peer", error)
        })?;

        let (io, tls_handshake, negotiated_h2) = if use_tls {
            let (tls_stream, duration) = self.handshake_tls(&host, stream).await?;
            let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
            (
                MaybeTlsStream::Tls(Box::new(tls_stream)),
                Some(duration),
                negotiated_h2,
            )
        } else {
            (MaybeTlsStream::Plain(stream), None, false)
        };

        let attributes = vec![
            KeyValue::new("server.address", host.clone()),
            KeyValue::new("server.port", i64::from(port)),
            KeyValue::new("network.peer.address", remote_addr.ip().to_string()),
        ];
        self.metrics.open_connections.add(1, &attributes);
        trace!(
            host = %host,
            port,
            peer = %remote_addr,
            tls = use_tls,
            "connection established"
        );

        let info = ConnectionInfo::new(remote_addr, dns_lookup, tcp_connect, tls_handshake);

        Ok(MeteredIo {
            io: TokioIo::new(io),
            info,
            negotiated_h2,
            metrics: self.metrics.clone(),
            attributes,
            opened_at: Instant::now(),
            _permit: permit,
        })
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Result<(Vec<SocketAddr>, Option<Duration>), ConnectError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok((vec![SocketAddr::new(ip, port)], None));
        }

        trace!(host, "dns lookup start");
        let started_at = Instant::now();
        let resolved = tokio::net::lookup_host((host, port)).await;
        let elapsed = started_at.elapsed();

        match resolved {
            Ok(addresses) => {
                self.metrics.dns_lookup_duration.record(
                    elapsed.as_secs_f64(),
                    &[KeyValue::new("dns.question.name", host.to_owned())],
                );
                trace!(host, elapsed_ms = elapsed.as_millis() as u64, "dns lookup done");
                let addresses = addresses.collect::<Vec<_>>();
                if addresses.is_empty() {
                    return Err(ConnectError::new(
                        TransportErrorKind::Dns,
                        format!("no addresses resolved for {host}"),
                    ));
                }
                Ok((addresses, Some(elapsed)))
            }
            Err(error) => {
                self.metrics.dns_lookup_duration.record(
                    elapsed.as_secs_f64(),
                    &[
                        KeyValue::new("dns.question.name", host.to_owned()),
                        KeyValue::new("error.type", classify_dns_error(&error)),
                    ],
                );
                Err(ConnectError::with_source(
                    TransportErrorKind::Dns,
                    format!("failed to resolve {host}"),
                    error,
                ))
            }
        }
    }

    async fn dial_tcp(
        &self,
        host: &str,
        addresses: &[SocketAddr],
    ) -> Result<(TcpStream, Duration), ConnectError> {
        let started_at = Instant::now();
        let mut last_error: Option<ConnectError> = None;

        for address in addresses {
            trace!(%address, "tcp connect start");
            let attempt = tokio::time::timeout(self.dial_timeout, TcpStream::connect(address));
            match attempt.await {
                Ok(Ok(stream)) => {
                    let elapsed = started_at.elapsed();
                    stream.set_nodelay(true).ok();
                    if let Some(keepalive) = &self.keepalive {
                        SockRef::from(&stream)
                            .set_tcp_keepalive(&keepalive.to_tcp_keepalive())
                            .ok();
                    }
                    trace!(%address, elapsed_ms = elapsed.as_millis() as u64, "tcp connect done");
                    return Ok((stream, elapsed));
                }
                Ok(Err(error)) => {
                    last_error = Some(ConnectError::with_source(
                        TransportErrorKind::Connect,
                        format!("failed to connect to {address}"),
                        error,
                    ));
                }
                Err(_) => {
                    last_error = Some(ConnectError::new(
                        TransportErrorKind::Connect,
                        format!(
                            "connect to {address} timed out after {}ms",
                            self.dial_timeout.as_millis()
                        ),
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ConnectError::new(
                TransportErrorKind::Connect,
                format!("no reachable address for {host}"),
            )
        }))
    }

    async fn handshake_tls(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<(tokio_rustls::client::TlsStream<TcpStream>, Duration), ConnectError> {
        let server_name = ServerName::try_from(host.to_owned()).map_err(|error| {
            ConnectError::with_source(
                TransportErrorKind::Tls,
                format!("invalid server name {host}"),
                error,
            )
        })?;

        trace!(host, "tls handshake start");
        let started_at = Instant::now();
        let handshake = tokio::time::timeout(
            self.tls_handshake_timeout,
            self.tls.connect(server_name, stream),
        );
        match handshake.await {
            Ok(Ok(tls_stream)) => {
                let elapsed = started_at.elapsed();
                trace!(host, elapsed_ms = elapsed.as_millis() as u64, "tls handshake done");
                Ok((tls_stream, elapsed))
            }
            Ok(Err(error)) => Err(ConnectError::with_source(
                TransportErrorKind::Tls,
                format!("tls handshake with {host} failed"),
                error,
            )),
            Err(_) => Err(ConnectError::new(
                TransportErrorKind::Tls,
                format!(
                    "tls handshake with {host} timed out after {}ms",
                    self.tls_handshake_timeout.as_millis()
                ),
            )),
        }
    }
}

impl tower_service::Service<Uri> for MeteredConnector {
    type Response = MeteredIo;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<MeteredIo, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(connector.connect(uri))
    }
}

pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Pooled connection IO. Increments `open_connections` while alive and
/// records `connection.duration` when the pool drops it.
pub(crate) struct MeteredIo {
    io: TokioIo<MaybeTlsStream>,
    info: ConnectionInfo,
    negotiated_h2: bool,
    metrics: Arc<HttpClientMetrics>,
    attributes: Vec<KeyValue>,
    opened_at: Instant,
    _permit: Option<OwnedSemaphorePermit>,
}

impl hyper::rt::Read for MeteredIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for MeteredIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }
}

impl Connection for MeteredIo {
    fn connected(&self) -> Connected {
        let connected = Connected::new().extra(self.info.clone());
        if self.negotiated_h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl Drop for MeteredIo {
    fn drop(&mut self) {
        self.metrics.open_connections.add(-1, &self.attributes);
        self.metrics
            .connection_duration
            .record(self.opened_at.elapsed().as_secs_f64(), &self.attributes);
        trace!(peer = %self.info.remote_addr(), "connection closed");
    }
}
