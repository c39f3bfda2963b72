//! Ambient observability for the pipeline itself: a small `prometheus`
//! registry plus an optional scrape endpoint. Modeled on the teacher's
//! `IntakeMetricsCollector`/`start_metrics_scrape_endpoint`, with `warp`
//! swapped for a bare `hyper` listener since only one route is needed here
//! (the teacher's general preference for minimal dependencies).
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, TextEncoder};
use std::net::SocketAddr;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),
    #[error("failed to bind metrics endpoint on {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
}

/// Counters/gauges describing the pipeline's own behavior, independent of
/// the records it is shipping. One [`PipelineMetrics`] is shared across all
/// sinks.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub records_submitted: IntCounterVec,
    pub records_dropped: IntCounterVec,
    pub records_retried: IntCounterVec,
    pub breaker_state: IntGaugeVec,
}

impl PipelineMetrics {
    pub fn new() -> Result<PipelineMetrics, MetricsError> {
        let records_submitted = prometheus::register_int_counter_vec!(
            "logflow_records_submitted_total",
            "Number of records accepted for a given sink",
            &["sink"]
        )?;
        let records_dropped = prometheus::register_int_counter_vec!(
            "logflow_records_dropped_total",
            "Number of records dropped due to a full queue, per sink",
            &["sink"]
        )?;
        let records_retried = prometheus::register_int_counter_vec!(
            "logflow_records_retried_total",
            "Number of send attempts (including the first) made against a sink",
            &["sink"]
        )?;
        let breaker_state = prometheus::register_int_gauge_vec!(
            "logflow_circuit_breaker_state",
            "Current circuit breaker state per sink (0=closed, 1=half_open, 2=open)",
            &["sink"]
        )?;

        Ok(PipelineMetrics {
            records_submitted,
            records_dropped,
            records_retried,
            breaker_state,
        })
    }

    pub fn record_breaker_state(&self, sink: &str, state: crate::circuit_breaker::BreakerState) {
        let value = match state {
            crate::circuit_breaker::BreakerState::Closed => 0,
            crate::circuit_breaker::BreakerState::HalfOpen => 1,
            crate::circuit_breaker::BreakerState::Open => 2,
        };
        self.breaker_state.with_label_values(&[sink]).set(value);
    }
}

/// Starts the `/metrics` scrape endpoint. The returned handle aborts the
/// server task when dropped; callers should keep it alive for the process
/// lifetime.
pub async fn start_metrics_scrape_endpoint(addr: SocketAddr) -> Result<tokio::task::JoinHandle<()>, MetricsError> {
    let make_svc = make_service_fn(|_conn| async { Ok::<_, hyper::Error>(service_fn(handle_scrape)) });

    let server = Server::try_bind(&addr)
        .map_err(|e| MetricsError::Bind(addr, std::io::Error::new(std::io::ErrorKind::AddrInUse, e)))?
        .serve(make_svc);

    info!(%addr, "serving metrics scrapes");
    Ok(tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(%err, "metrics server exited unexpectedly");
        }
    }))
}

async fn handle_scrape(req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap());
    }

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(%err, "failed to encode prometheus metrics");
        return Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap());
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(buffer))
        .unwrap())
}
