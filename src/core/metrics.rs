use std::sync::{Arc, OnceLock};

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Histogram, Meter, UpDownCounter};

/// Bucket boundaries for request-scoped durations, in seconds.
const REQUEST_DURATION_BOUNDARIES: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Bucket boundaries for connection lifetimes, in seconds.
const CONNECTION_DURATION_BOUNDARIES: [f64; 14] = [
    0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Instruments recorded by the client. Recording is concurrency-safe; the
/// struct is shared behind an `Arc` between clients, hosts, and the
/// transport layer.
pub struct HttpClientMetrics {
    pub(crate) request_duration: Histogram<f64>,
    pub(crate) active_requests: UpDownCounter<i64>,
    pub(crate) request_body_size: Histogram<u64>,
    pub(crate) response_body_size: Histogram<u64>,
    pub(crate) server_duration: Histogram<f64>,
    pub(crate) dns_lookup_duration: Histogram<f64>,
    pub(crate) idle_connection_duration: Histogram<f64>,
    pub(crate) connection_duration: Histogram<f64>,
    pub(crate) open_connections: UpDownCounter<i64>,
}

impl std::fmt::Debug for HttpClientMetrics {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HttpClientMetrics").finish()
    }
}

impl HttpClientMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_duration: meter
                .f64_histogram("http.client.request.duration")
                .with_description("Duration of HTTP client requests.")
                .with_unit("s")
                .with_boundaries(REQUEST_DURATION_BOUNDARIES.to_vec())
                .build(),
            active_requests: meter
                .i64_up_down_counter("http.client.active_requests")
                .with_description("Number of active HTTP requests.")
                .with_unit("{request}")
                .build(),
            request_body_size: meter
                .u64_histogram("http.client.request.body.size")
                .with_description("Size of HTTP client request bodies.")
                .with_unit("By")
                .build(),
            response_body_size: meter
                .u64_histogram("http.client.response.body.size")
                .with_description("Size of HTTP client response bodies.")
                .with_unit("By")
                .build(),
            server_duration: meter
                .f64_histogram("http.client.server.duration")
                .with_description("The duration of the server for responding to the first byte.")
                .with_unit("s")
                .with_boundaries(REQUEST_DURATION_BOUNDARIES.to_vec())
                .build(),
            dns_lookup_duration: meter
                .f64_histogram("dns.lookup.duration")
                .with_description("Measures the time taken to perform a DNS lookup.")
                .with_unit("s")
                .build(),
            idle_connection_duration: meter
                .f64_histogram("http.client.idle_connection.duration")
                .with_description("The duration of how long the connection was previously idle.")
                .with_unit("s")
                .with_boundaries(CONNECTION_DURATION_BOUNDARIES.to_vec())
                .build(),
            connection_duration: meter
                .f64_histogram("http.client.connection.duration")
                .with_description(
                    "The duration of the successfully established outbound HTTP connections.",
                )
                .with_unit("s")
                .with_boundaries(CONNECTION_DURATION_BOUNDARIES.to_vec())
                .build(),
            open_connections: meter
                .i64_up_down_counter("http.client.open_connections")
                .with_description(
                    "Number of outbound HTTP connections that are currently active or idle on the client.",
                )
                .with_unit("{connection}")
                .build(),
        }
    }
}

/// Process-wide metrics pair, initialized once from the global meter
/// provider. Clients built without an explicit meter share this instance;
/// inject a dedicated `HttpClientMetrics` to avoid attribute bleed between
/// clients that must stay separate.
pub fn global_metrics() -> Arc<HttpClientMetrics> {
    static GLOBAL: OnceLock<Arc<HttpClientMetrics>> = OnceLock::new();
    GLOBAL
        .get_or_init(|| Arc::new(HttpClientMetrics::new(&global::meter("httpc"))))
        .clone()
}

/// RAII guard pairing an `active_requests` increment with its decrement.
pub(crate) struct ActiveRequestGuard {
    metrics: Arc<HttpClientMetrics>,
    attributes: Vec<KeyValue>,
}

impl ActiveRequestGuard {
    pub(crate) fn enter(metrics: Arc<HttpClientMetrics>, attributes: Vec<KeyValue>) -> Self {
        metrics.active_requests.add(1, &attributes);
        Self {
            metrics,
            attributes,
        }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.metrics.active_requests.add(-1, &self.attributes);
    }
}
