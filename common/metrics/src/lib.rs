//! Prometheus exporter plumbing shared by the long-running binaries.
//!
//! Each binary builds its liveness router, calls [`setup_metrics_routes`] to
//! mount `/metrics`, and hands the result to [`serve`].

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram buckets in milliseconds, sized for broker and HTTP round trips.
const BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
];

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(BUCKETS_MS)
        .expect("bucket list is non-empty")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Mounts the `/metrics` endpoint; call once, after all other routes.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = setup_metrics_recorder();
    router.route(
        "/metrics",
        get(move || std::future::ready(handle.render())),
    )
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
