//! Prometheus exporter that turns the results of configured SQL queries
//! against a DuckDB database into metric samples.

pub mod api;
pub mod coerce;
pub mod config;
pub mod db;
pub mod definitions;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod scrape;

pub use error::{ExporterError, Result};
