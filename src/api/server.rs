use axum::{
    extract::State,
    http::header,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{IntGaugeVec, Opts, Registry};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    metrics::{encode_text, TEXT_CONTENT_TYPE},
    scrape::Exporter,
    ExporterError, Result,
};

#[derive(Clone)]
pub struct AppState {
    pub exporter: Arc<Exporter>,
    pub registry: Registry,
    pub telemetry_path: String,
    /// Receives the message of an error that must stop the process.
    pub fatal_tx: mpsc::Sender<String>,
}

impl AppState {
    pub fn new(
        exporter: Arc<Exporter>,
        namespace: &str,
        telemetry_path: impl Into<String>,
        fatal_tx: mpsc::Sender<String>,
    ) -> Result<Self> {
        Ok(Self {
            exporter,
            registry: build_registry(namespace)?,
            telemetry_path: telemetry_path.into(),
            fatal_tx,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub up: bool,
    pub last_scrape_error: bool,
    pub scrapes_total: u64,
}

/// Registry for process-level metrics served next to the scrape samples.
pub fn build_registry(namespace: &str) -> Result<Registry> {
    let registry = Registry::new();

    let build_info = IntGaugeVec::new(
        Opts::new(
            "build_info",
            "A metric with a constant '1' value labeled by version of the exporter.",
        )
        .namespace(namespace)
        .subsystem("exporter"),
        &["version"],
    )?;
    build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1);
    registry.register(Box::new(build_info))?;

    #[cfg(target_os = "linux")]
    registry.register(Box::new(
        prometheus::process_collector::ProcessCollector::for_self(),
    ))?;

    Ok(registry)
}

pub fn create_router(state: AppState) -> Router {
    let telemetry_path = state.telemetry_path.clone();

    Router::new()
        .route("/", get(landing_handler))
        .route(&telemetry_path, get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn landing_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>DuckDB Exporter</title></head>\n<body>\n\
         <h1>DuckDB Exporter</h1>\n<p><a href=\"{path}\">Metrics</a></p>\n\
         </body>\n</html>\n",
        path = state.telemetry_path
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response> {
    let samples = match state.exporter.collect().await {
        Ok(samples) => samples,
        Err(e) => {
            if e.is_fatal() {
                error!(error = %e, "Fatal error while scraping, shutting down");
                let _ = state.fatal_tx.try_send(e.to_string());
            }
            return Err(e);
        }
    };

    let body = encode_text(&samples, state.registry.gather())?;
    Ok(([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response())
}

async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.exporter.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        up: stats.is_up(),
        last_scrape_error: stats.last_failed(),
        scrapes_total: stats.scrapes(),
    })
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state);
    let addr = listener
        .local_addr()
        .map_err(|e| ExporterError::Internal(format!("Failed to read listener address: {}", e)))?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ExporterError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_build_info() {
        let registry = build_registry("duckdb").unwrap();
        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.contains(&"duckdb_exporter_build_info".to_string()));
    }
}
