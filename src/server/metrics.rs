//! Prometheus metrics for the Depot server.

use axum::http::Method;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabelsWithStatus {
    pub method: HttpMethod,
    pub endpoint: String,
    pub status: u16,
}

/// HTTP method label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Other,
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => HttpMethod::Get,
            Method::POST => HttpMethod::Post,
            Method::PUT => HttpMethod::Put,
            Method::DELETE => HttpMethod::Delete,
            Method::PATCH => HttpMethod::Patch,
            Method::HEAD => HttpMethod::Head,
            Method::OPTIONS => HttpMethod::Options,
            _ => HttpMethod::Other,
        }
    }
}

/// Labels for the latency histogram (status is unknown at request start).
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: HttpMethod,
    pub endpoint: String,
}

/// Labels for KV operation counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct KvOpLabels {
    pub op: String,
}

/// Container for all Prometheus metrics.
pub struct Metrics {
    registry: Registry,

    /// Counter of KV operations by kind.
    pub kv_operations_total: Family<KvOpLabels, Counter>,

    /// Counter of objects stored.
    pub object_uploads_total: Counter,

    /// Counter of object bytes written.
    pub object_bytes_written_total: Counter,

    /// Counter of watch events dispatched to subscribers.
    pub watch_events_total: Counter,

    /// Gauge of live watch subscribers.
    pub watch_subscribers: Gauge,

    /// Counter of HTTP requests.
    pub http_requests_total: Family<HttpLabelsWithStatus, Counter>,

    /// Histogram of HTTP request latency in seconds.
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,

    /// Gauge of currently in-flight requests.
    pub http_requests_in_flight: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let kv_operations_total = Family::<KvOpLabels, Counter>::default();
        registry.register(
            "kv_operations_total",
            "Total number of KV operations by kind",
            kv_operations_total.clone(),
        );

        let object_uploads_total = Counter::default();
        registry.register(
            "object_uploads_total",
            "Total number of completed object uploads",
            object_uploads_total.clone(),
        );

        let object_bytes_written_total = Counter::default();
        registry.register(
            "object_bytes_written_total",
            "Total number of object bytes written",
            object_bytes_written_total.clone(),
        );

        let watch_events_total = Counter::default();
        registry.register(
            "watch_events_total",
            "Total number of watch events dispatched",
            watch_events_total.clone(),
        );

        let watch_subscribers = Gauge::default();
        registry.register(
            "watch_subscribers",
            "Number of live watch subscribers",
            watch_subscribers.clone(),
        );

        let http_requests_total = Family::<HttpLabelsWithStatus, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total number of HTTP requests",
            http_requests_total.clone(),
        );

        // Buckets from 1ms to ~8s.
        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_requests_in_flight = Gauge::default();
        registry.register(
            "http_requests_in_flight",
            "Number of HTTP requests currently being processed",
            http_requests_in_flight.clone(),
        );

        Self {
            registry,
            kv_operations_total,
            object_uploads_total,
            object_bytes_written_total,
            watch_events_total,
            watch_subscribers,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
        }
    }

    pub fn kv_op(&self, op: &str) {
        self.kv_operations_total
            .get_or_create(&KvOpLabels { op: op.to_string() })
            .inc();
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}
