//! Scrape engine: per-definition execution and cycle coordination.

mod coordinator;
mod executor;

pub use coordinator::{CycleOutcome, DefinitionFailure, Exporter, ScrapeMode, ScrapeSnapshot};
pub use executor::{sanitize_name, GenericRow, MetricExecutor};
