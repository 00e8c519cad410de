//! Prometheus metrics of the reconciliation loop, served over HTTP

use crate::error::Result;
use egress_core::WriteStats;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassResult {
    Success,
    Skipped,
    Error,
}

impl PassResult {
    fn as_str(self) -> &'static str {
        match self {
            PassResult::Success => "success",
            PassResult::Skipped => "skipped",
            PassResult::Error => "error",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    /// Reconciliation passes by result
    pub reconcile_total: CounterVec,
    /// Reconciliation pass duration in seconds
    pub reconcile_duration_seconds: HistogramVec,
    /// Northbound writes by operation
    pub nb_operations_total: CounterVec,
    /// Gateway teardowns by result
    pub teardown_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconcile_total = CounterVec::new(
            Opts::new("egress_reconcile_total", "Egress gateway reconciliation passes"),
            &["result"],
        )?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "egress_reconcile_duration_seconds",
                "Egress gateway reconciliation latency in seconds",
            ),
            &["result"],
        )?;

        let nb_operations_total = CounterVec::new(
            Opts::new("egress_nb_operations_total", "Northbound database writes"),
            &["op"],
        )?;

        let teardown_total = CounterVec::new(
            Opts::new("egress_teardown_total", "Egress gateway teardowns"),
            &["result"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(nb_operations_total.clone()))?;
        registry.register(Box::new(teardown_total.clone()))?;

        Ok(Self {
            reconcile_total,
            reconcile_duration_seconds,
            nb_operations_total,
            teardown_total,
            registry,
        })
    }

    pub fn record_pass(&self, result: PassResult, elapsed: Duration) {
        let label = result.as_str();
        self.reconcile_total.with_label_values(&[label]).inc();
        self.reconcile_duration_seconds
            .with_label_values(&[label])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_writes(&self, stats: &WriteStats) {
        for (op, count) in [("create", stats.created), ("update", stats.updated), ("delete", stats.deleted)] {
            if count > 0 {
                self.nb_operations_total.with_label_values(&[op]).inc_by(count as f64);
            }
        }
    }

    pub fn record_teardown(&self, success: bool) {
        let result = if success { "success" } else { "error" };
        self.teardown_total.with_label_values(&[result]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Serve `/metrics` and `/healthz` until the process exits
pub async fn serve(addr: SocketAddr, metrics: Metrics) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics listening on http://{}", addr);

    let metrics = Arc::new(metrics);
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(handle_request(req, &metrics)) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving metrics connection from {}: {}", peer_addr, e);
            }
        });
    }
}

fn handle_request<B>(req: Request<B>, metrics: &Metrics) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => response(StatusCode::OK, "text/plain", "ok".to_string()),
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(body) => response(StatusCode::OK, "text/plain; version=0.0.4", body),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
            }
        },
        _ => response(StatusCode::NOT_FOUND, "text/plain", "not found".to_string()),
    }
}

fn response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_record_pass_and_writes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_pass(PassResult::Success, Duration::from_millis(20));
        metrics.record_pass(PassResult::Skipped, Duration::from_millis(1));
        metrics.record_writes(&WriteStats {
            created: 3,
            updated: 0,
            deleted: 1,
        });

        assert_eq!(metrics.reconcile_total.with_label_values(&["success"]).get(), 1.0);
        assert_eq!(metrics.reconcile_total.with_label_values(&["skipped"]).get(), 1.0);
        assert_eq!(metrics.nb_operations_total.with_label_values(&["create"]).get(), 3.0);
        assert_eq!(metrics.nb_operations_total.with_label_values(&["delete"]).get(), 1.0);

        let text = metrics.gather().unwrap();
        assert!(text.contains("egress_reconcile_total{result=\"success\"} 1"));
        assert!(text.contains("egress_reconcile_duration_seconds_count{result=\"success\"} 1"));
        assert!(!text.contains("op=\"update\""));
    }

    #[tokio::test]
    async fn test_routes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_teardown(false);

        let healthz = handle_request(request("/healthz"), &metrics);
        assert_eq!(healthz.status(), StatusCode::OK);
        assert_eq!(body(healthz).await, "ok");

        let scrape = handle_request(request("/metrics"), &metrics);
        assert_eq!(scrape.status(), StatusCode::OK);
        assert!(body(scrape).await.contains("egress_teardown_total{result=\"error\"} 1"));

        let missing = handle_request(request("/other"), &metrics);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
