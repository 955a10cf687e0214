//! Prometheus metrics infrastructure with singleton-based initialization.
//!
//! A shared metrics recorder that can be safely initialized once and used
//! across the whole process:
//! - `OnceLock` ensures thread-safe, one-time initialization
//! - `init_test()` handles races where multiple test threads initialize

use axum::{routing::get, Extension, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Default histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Global metrics controller singleton.
static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Controller for the shared metrics recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

/// Initialize the metrics server for production use.
///
/// Starts a Prometheus HTTP endpoint on the given address with:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - Health check endpoint (returns 200 OK)
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .expect("valid bucket configuration")
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    tokio::spawn(run_server(addr));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Initialize the metrics subsystem for tests.
///
/// Uses the same recorder setup but does NOT start an HTTP endpoint.
/// Safe to call multiple times from different test threads.
pub fn init_test() {
    if init_test_inner().is_err() {
        // Another thread is initializing. Wait for it to complete.
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

fn init_test_inner() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .expect("valid bucket configuration")
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    Ok(())
}

impl MetricsController {
    /// Get a reference to the global metrics controller.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Run the HTTP server for metrics and health endpoints.
async fn run_server(addr: SocketAddr) {
    let controller = CONTROLLER
        .get()
        .expect("controller initialized before server spawn");

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(controller.handle.clone()));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        assert!(MetricsController::get().is_ok());
    }

    #[test]
    fn test_controller_render() {
        init_test();

        counter!("floe_test_counter").increment(7);

        let controller = MetricsController::get().unwrap();
        assert!(controller.render().contains("floe_test_counter"));
    }
}
