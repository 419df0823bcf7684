use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tracing::trace;

use crate::connect::{ConnectionInfo, ConnectionUse};
use crate::error::Error;
use crate::metrics::HttpClientMetrics;

pub(crate) fn tracer() -> BoxedTracer {
    global::tracer("httpc")
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// Per-attempt span plus metric recording, in either simple or detailed
/// mode.
///
/// Simple mode records `server.duration` as the whole attempt time at
/// `end`. Detailed mode additionally consumes the dial observation riding
/// the connection: it emits the `http.stats.*` span attributes, records
/// `idle_connection.duration` for idle-reused connections, and measures
/// `server.duration` as wait-to-first-byte excluding connection setup.
pub(crate) struct AttemptTracer {
    cx: Context,
    metrics: Arc<HttpClientMetrics>,
    metric_attributes: Vec<KeyValue>,
    detailed: bool,
    started_at: Instant,
    connection: Option<(ConnectionInfo, ConnectionUse)>,
    first_byte_at: Option<Instant>,
    total_time: Option<Duration>,
}

impl AttemptTracer {
    pub(crate) fn start(
        parent: &Context,
        name: String,
        detailed: bool,
        metrics: Arc<HttpClientMetrics>,
    ) -> Self {
        let tracer = tracer();
        let span = tracer
            .span_builder(name)
            .with_kind(SpanKind::Client)
            .start_with_context(&tracer, parent);
        Self {
            cx: parent.with_span(span),
            metrics,
            metric_attributes: Vec::new(),
            detailed,
            started_at: Instant::now(),
            connection: None,
            first_byte_at: None,
            total_time: None,
        }
    }

    pub(crate) fn context(&self) -> &Context {
        &self.cx
    }

    pub(crate) fn set_attribute(&self, attribute: KeyValue) {
        self.cx.span().set_attribute(attribute);
    }

    /// Attribute set shared by every metric this attempt records.
    pub(crate) fn set_metric_attributes(&mut self, attributes: Vec<KeyValue>) {
        self.metric_attributes = attributes;
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection
            .as_ref()
            .map(|(info, _)| info.remote_addr())
    }

    /// Consume the dial observation attached to the response. Must run
    /// before `record_first_byte` so server time can exclude setup.
    pub(crate) fn observe_connection(&mut self, info: &ConnectionInfo) {
        let usage = info.mark_used();

        if self.detailed {
            self.set_attribute(KeyValue::new("http.stats.is_connection_reused", usage.reused));
            let was_idle = usage.reused && !usage.idle_for.is_zero();
            self.set_attribute(KeyValue::new("http.stats.is_connection_was_idle", was_idle));

            if usage.reused {
                if was_idle {
                    self.metrics
                        .idle_connection_duration
                        .record(usage.idle_for.as_secs_f64(), &self.metric_attributes);
                    self.set_attribute(KeyValue::new(
                        "http.stats.idle_connection_time_ms",
                        millis(usage.idle_for),
                    ));
                }
                trace!(
                    peer = %info.remote_addr(),
                    idle_ms = usage.idle_for.as_millis() as u64,
                    "reused pooled connection"
                );
            } else {
                if let Some(dns_lookup) = info.dns_lookup() {
                    self.set_attribute(KeyValue::new(
                        "http.stats.dns_lookup_time_ms",
                        millis(dns_lookup),
                    ));
                }
                self.set_attribute(KeyValue::new(
                    "http.stats.tcp_connection_time_ms",
                    millis(info.tcp_connect()),
                ));
                if let Some(tls_handshake) = info.tls_handshake() {
                    self.set_attribute(KeyValue::new(
                        "http.stats.tls_handshake_time_ms",
                        millis(tls_handshake),
                    ));
                }
                let acquire = info
                    .established_at()
                    .saturating_duration_since(self.started_at);
                self.set_attribute(KeyValue::new(
                    "http.stats.connection_acquire_time_ms",
                    millis(acquire),
                ));
                trace!(peer = %info.remote_addr(), "fresh connection for attempt");
            }
        }

        self.connection = Some((info.clone(), usage));
    }

    /// Response headers arrived; in detailed mode this is the moment
    /// `server.duration` is measured from connection readiness.
    pub(crate) fn record_first_byte(&mut self) {
        let now = Instant::now();
        self.first_byte_at = Some(now);

        if self.detailed {
            let server_time = now.saturating_duration_since(self.server_time_origin());
            self.metrics
                .server_duration
                .record(server_time.as_secs_f64(), &self.metric_attributes);
            self.set_attribute(KeyValue::new(
                "http.stats.server_time_ms",
                millis(server_time),
            ));
        }
    }

    fn server_time_origin(&self) -> Instant {
        match &self.connection {
            Some((info, usage)) if !usage.reused => info.established_at(),
            _ => self.started_at,
        }
    }

    pub(crate) fn error(&self, message: &str, error: &Error) {
        let span = self.cx.span();
        span.set_status(Status::error(message.to_owned()));
        span.record_error(error);
    }

    pub(crate) fn ok(&self) {
        self.cx.span().set_status(Status::Ok);
    }

    /// End the span and flush duration metrics. Idempotent.
    pub(crate) fn end(&mut self) {
        if self.total_time.is_some() {
            return;
        }
        let now = Instant::now();
        let total = now.saturating_duration_since(self.started_at);
        self.total_time = Some(total);

        if self.detailed {
            match self.first_byte_at {
                Some(first_byte_at) => {
                    self.set_attribute(KeyValue::new(
                        "http.stats.response_time_ms",
                        millis(now.saturating_duration_since(first_byte_at)),
                    ));
                }
                None => {
                    // The attempt failed before any response byte; still
                    // account the wait against the server.
                    let waited = now.saturating_duration_since(self.server_time_origin());
                    self.metrics
                        .server_duration
                        .record(waited.as_secs_f64(), &self.metric_attributes);
                }
            }
        } else {
            self.metrics
                .server_duration
                .record(total.as_secs_f64(), &self.metric_attributes);
        }

        self.cx.span().end();
    }

    pub(crate) fn total_time(&self) -> Duration {
        self.total_time.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::global_metrics;

    #[test]
    fn end_is_idempotent() {
        let mut tracer = AttemptTracer::start(
            &Context::current(),
            "GET".to_owned(),
            false,
            global_metrics(),
        );
        tracer.end();
        let first = tracer.total_time();
        std::thread::sleep(Duration::from_millis(2));
        tracer.end();
        assert_eq!(tracer.total_time(), first);
    }

    #[test]
    fn millis_conversion() {
        assert!((millis(Duration::from_millis(1500)) - 1500.0).abs() < f64::EPSILON);
    }
}
