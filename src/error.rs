use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("Database unreachable: {0}")]
    Connectivity(#[source] DbError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot load metric definitions from {path}: {reason}")]
    ConfigLoad { path: String, reason: String },

    #[error("No request defined for context '{context}'")]
    MissingRequest { context: String },

    #[error("No metricsdesc defined for context '{context}'")]
    MissingDescriptors { context: String },

    #[error("No metricsbuckets entry for histogram '{column}' in context '{context}'")]
    MissingBucketConfig { context: String, column: String },

    #[error("Query timed out after {0:?}")]
    QueryTimeout(std::time::Duration),

    #[error("Query failed: {0}")]
    Query(#[source] DbError),

    #[error("No metrics found while parsing context '{context}'")]
    NoMetrics { context: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    pub(crate) fn config_load(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        ExporterError::ConfigLoad {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Configuration failures cannot be recovered from by a later cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExporterError::Config(_) | ExporterError::ConfigLoad { .. }
        )
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(err: prometheus::Error) -> Self {
        ExporterError::Encoding(err.to_string())
    }
}

impl IntoResponse for ExporterError {
    fn into_response(self) -> Response {
        let status = match self {
            ExporterError::Connectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
