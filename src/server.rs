// ============================================================================
// SCRAPE ENDPOINT
// ============================================================================
// Serves the exporter's registry in the Prometheus text format. Each scrape
// is also the interval controller's clock: the gap between two scrapes is
// what the poll tasks retune to.
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{ExporterError, ExporterResult};
use crate::interval::IntervalController;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct ScrapeState {
    registry: Registry,
    interval: Option<Arc<IntervalController>>,
}

/// Rendering failure, answered with a 500.
#[derive(Debug)]
pub struct MetricsError(String);

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        error!(target: "anka_exporter::server", error = %self.0, "Failed to render metrics");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0).into_response()
    }
}

/// Encode every family in `registry` as Prometheus text.
pub fn render(registry: &Registry) -> Result<String, MetricsError> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError(e.to_string()))
}

/// Router serving `metrics_path`. Pass `None` for `interval` to leave the
/// poll cadence alone.
pub fn router(registry: Registry, interval: Option<Arc<IntervalController>>, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .with_state(ScrapeState { registry, interval })
        .layer(TraceLayer::new_for_http())
}

async fn metrics_handler(State(state): State<ScrapeState>) -> Result<impl IntoResponse, MetricsError> {
    if let Some(controller) = &state.interval {
        if let Some(secs) = controller.on_scrape() {
            info!(
                target: "anka_exporter::server",
                interval_secs = secs,
                "Poll interval follows scrape cadence"
            );
        }
    }

    let body = render(&state.registry)?;
    Ok(([(header::CONTENT_TYPE, CONTENT_TYPE)], body))
}

pub async fn bind(listen_address: &str) -> ExporterResult<TcpListener> {
    let addr: SocketAddr = listen_address
        .parse()
        .map_err(|e| ExporterError::Internal(format!("invalid listen address {}: {}", listen_address, e)))?;
    Ok(TcpListener::bind(addr).await?)
}

/// Serve `app` until `cancel` fires.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> ExporterResult<()> {
    let local = listener.local_addr()?;
    info!(target: "anka_exporter::server", address = %local, "Scrape endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!(target: "anka_exporter::server", "Scrape endpoint stopped");
    Ok(())
}
