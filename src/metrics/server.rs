//! Prometheus scrape endpoint for long pipeline runs.
//!
//! `/metrics` renders the recorder; `/health` answers liveness probes while a
//! run is in progress. The port is bound before `init` returns, so a taken
//! address fails the command instead of being logged from a background task.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{BindSnafu, MetricsError, PrometheusInitSnafu};

/// Histogram buckets (seconds) for stage and command durations: a probe takes
/// milliseconds, a bulk import or streaming job can take half an hour.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0,
];

/// Install the global recorder and serve it on `addr`.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let listener = listen(addr)?;
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    info!(%addr, "Metrics endpoint listening");
    tokio::spawn(serve(listener, handle));
    Ok(())
}

fn listen(addr: SocketAddr) -> Result<TcpListener, MetricsError> {
    let listener = std::net::TcpListener::bind(addr).context(BindSnafu { addr })?;
    listener.set_nonblocking(true).context(BindSnafu { addr })?;
    TcpListener::from_std(listener).context(BindSnafu { addr })
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
}

async fn serve(listener: TcpListener, handle: PrometheusHandle) {
    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!(error = %e, "Metrics server stopped");
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
