//! Prometheus metrics for the MySQL connection engine
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Connection engine metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,
    /// Handshakes slower than the configured threshold
    pub connections_slow: IntCounter,
    /// Handler panics caught by the listener
    pub connection_panics: IntCounter,

    // Command metrics
    /// Commands dispatched by name
    pub commands_total: IntCounterVec,
    /// Connection-ending errors by kind
    pub connection_errors_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "mysqlwire_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "mysqlwire_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "mysqlwire_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let connections_slow = IntCounter::new(
            "mysqlwire_connections_slow_total",
            "Number of connections whose handshake exceeded the warn threshold",
        )
        .unwrap();

        let connection_panics = IntCounter::new(
            "mysqlwire_connection_panics_total",
            "Number of connection tasks that panicked",
        )
        .unwrap();

        let commands_total = IntCounterVec::new(
            Opts::new("mysqlwire_commands_total", "Total number of commands dispatched"),
            &["command"], // query, ping, stmt_execute, etc.
        )
        .unwrap();

        let connection_errors_total = IntCounterVec::new(
            Opts::new(
                "mysqlwire_connection_errors_total",
                "Total number of connections ended by an error",
            ),
            &["kind"], // io, sequence, protocol, etc.
        )
        .unwrap();

        let collectors: [Box<dyn Collector>; 7] = [
            Box::new(connections_total.clone()),
            Box::new(connections_active.clone()),
            Box::new(connections_closed.clone()),
            Box::new(connections_slow.clone()),
            Box::new(connection_panics.clone()),
            Box::new(commands_total.clone()),
            Box::new(connection_errors_total.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            connections_slow,
            connection_panics,
            commands_total,
            connection_errors_total,
        }
    }

    /// Record a dispatched command
    pub fn record_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }

    /// Record a connection ended by an error
    pub fn record_connection_error(&self, kind: &str) {
        self.connection_errors_total.with_label_values(&[kind]).inc();
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record a slow handshake
    pub fn record_slow_connection(&self) {
        self.connections_slow.inc();
    }

    /// Record a caught connection panic
    pub fn record_panic(&self) {
        self.connection_panics.inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let response = match req.uri().path() {
            "/metrics" => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(metrics().gather()))),
            "/health" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK"))),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found"))),
        };
        Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
