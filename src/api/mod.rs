//! HTTP surface: landing page, telemetry endpoint and liveness probe.

mod server;

pub use server::{build_registry, create_router, serve, AppState, HealthResponse};
