//! Exporter settings.
//!
//! The binary fills [`ExporterConfig`] from command line flags and their
//! environment variables; the library only consumes the validated struct.

use std::path::PathBuf;
use std::time::Duration;

use crate::definitions::DefinitionSources;
use crate::scrape::ScrapeMode;
use crate::{ExporterError, Result};

pub const DEFAULT_NAMESPACE: &str = "duckdb";
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ExporterConfig {
    /// `""` or `:memory:` opens an in-memory database, anything else is a file path.
    pub dsn: String,
    pub max_idle_conns: u32,
    pub max_open_conns: u32,
    /// Custom definition files, applied in order after the defaults.
    pub custom_metrics: Vec<PathBuf>,
    /// Replaces the embedded built-in definitions when set.
    pub default_metrics: Option<PathBuf>,
    pub query_timeout: Duration,
    /// Zero means on-demand scraping.
    pub scrape_interval: Duration,
    pub namespace: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            max_idle_conns: 0,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            custom_metrics: Vec::new(),
            default_metrics: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            scrape_interval: Duration::ZERO,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl ExporterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_open_conns == 0 {
            return Err(ExporterError::Config(
                "max_open_conns must be positive".to_string(),
            ));
        }

        if self.max_idle_conns > self.max_open_conns {
            return Err(ExporterError::Config(format!(
                "max_idle_conns ({}) exceeds max_open_conns ({})",
                self.max_idle_conns, self.max_open_conns
            )));
        }

        if self.query_timeout.is_zero() {
            return Err(ExporterError::Config(
                "query_timeout must be positive".to_string(),
            ));
        }

        if self.namespace.is_empty() {
            return Err(ExporterError::Config("namespace must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn definition_sources(&self) -> DefinitionSources {
        DefinitionSources {
            default_file: self.default_metrics.clone(),
            custom: self.custom_metrics.clone(),
        }
    }

    pub fn scrape_mode(&self) -> ScrapeMode {
        if self.scrape_interval.is_zero() {
            ScrapeMode::OnDemand
        } else {
            ScrapeMode::Scheduled(self.scrape_interval)
        }
    }
}

/// Split a comma-delimited list of definition files, dropping empty entries.
pub fn parse_custom_metrics(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Parse a humantime duration such as `30s` or `1m30s`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    // Bare zero is accepted so the on-demand default can be spelled `0`.
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
