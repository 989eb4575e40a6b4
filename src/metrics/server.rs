//! Prometheus metrics server with singleton-based initialization.
//!
//! `OnceLock` holds the recorder handle; `init_test()` tolerates concurrent
//! callers from parallel test threads.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Histogram buckets for payload and object sizes (in bytes).
const SIZE_BUCKETS: &[f64] = &[
    1024.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0, 10485760.0, 104857600.0,
];

/// Global metrics controller singleton.
static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Controller for the shared metrics server.
pub struct MetricsController {
    handle: PrometheusHandle,
}

fn build_recorder() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .set_buckets_for_metric(Matcher::Suffix("_bytes".to_string()), SIZE_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)
}

/// Initialize the metrics server for production use.
///
/// Starts a Prometheus HTTP endpoint on the given address with:
/// - `/metrics` - Prometheus metrics in text format
/// - `/health` - Health check endpoint (returns 200 OK)
///
/// # Errors
///
/// Returns an error if the server is already initialized or the Prometheus
/// recorder fails to install.
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = build_recorder()?;

    CONTROLLER
        .set(MetricsController {
            handle: handle.clone(),
        })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    tokio::spawn(run_server(addr, handle));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Initialize the metrics subsystem for tests.
///
/// Installs the recorder without an HTTP endpoint. Safe to call from many
/// test threads at once.
pub fn init_test() {
    if init_test_inner().is_err() {
        // Another thread is initializing. Wait for it to complete.
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

fn init_test_inner() -> Result<(), MetricsError> {
    let handle = build_recorder()?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    Ok(())
}

impl MetricsController {
    /// Get a reference to the global metrics controller.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics have not been initialized.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

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
