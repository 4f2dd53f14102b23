//! Metric definitions: one configured query plus its naming, labeling and
//! typing rules.
//!
//! Definition files are TOML (`[[metric]]` tables) when the file name ends in
//! `toml`, and YAML (a top-level `metrics:` list) otherwise. Both decoders fill
//! the same [`MetricDefinition`] schema.

mod store;

pub use store::{DefinitionSources, MetricStore};

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::{ExporterError, Result};

/// Built-in definitions shipped with the exporter.
pub const BUILTIN_DEFINITIONS: &str = include_str!("../../default-metrics.toml");

/// Sample type of a descriptor column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Histogram => "histogram",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "gauge" => Some(MetricKind::Gauge),
            "counter" => Some(MetricKind::Counter),
            "histogram" => Some(MetricKind::Histogram),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured query and the rules turning its rows into samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricDefinition {
    pub context: String,
    pub labels: Vec<String>,
    /// Descriptor column -> help text.
    pub metrics_desc: BTreeMap<String, String>,
    /// Lower-cased descriptor column -> kind. Absent columns are gauges.
    pub metrics_type: BTreeMap<String, MetricKind>,
    /// Histogram column -> (bucket column -> upper bound).
    pub metrics_buckets: BTreeMap<String, BTreeMap<String, String>>,
    pub field_to_append: Option<String>,
    pub request: String,
    pub ignore_zero_result: bool,
}

impl MetricDefinition {
    pub fn kind_of(&self, column: &str) -> MetricKind {
        self.metrics_type
            .get(&column.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Column whose value becomes the sample name suffix, if set.
    pub fn appended_field(&self) -> Option<&str> {
        self.field_to_append
            .as_deref()
            .filter(|field| !field.is_empty())
    }
}

/// On-disk shape of a single definition. Keys follow the historical
/// lower-case spelling (`metricsdesc`, `fieldtoappend`, ...).
#[derive(Debug, Deserialize)]
struct RawDefinition {
    #[serde(default)]
    context: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default, alias = "metricsDesc")]
    metricsdesc: BTreeMap<String, String>,
    #[serde(default, alias = "metricsType")]
    metricstype: BTreeMap<String, String>,
    #[serde(default, alias = "metricsBuckets")]
    metricsbuckets: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, alias = "fieldToAppend")]
    fieldtoappend: Option<String>,
    #[serde(default)]
    request: String,
    #[serde(default, alias = "ignoreZeroResult")]
    ignorezeroresult: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default, rename = "metric", alias = "metrics")]
    metric: Vec<RawDefinition>,
}

impl RawDefinition {
    fn validate(self, origin: &Path) -> Result<MetricDefinition> {
        let mut metrics_type = BTreeMap::new();
        for (column, raw_kind) in self.metricstype {
            let kind = MetricKind::parse(&raw_kind).ok_or_else(|| {
                ExporterError::config_load(
                    origin,
                    format!(
                        "context '{}': unknown metricstype '{}' for '{}'",
                        self.context, raw_kind, column
                    ),
                )
            })?;
            metrics_type.insert(column.to_lowercase(), kind);
        }

        let mut seen = HashSet::new();
        if let Some(label) = self.labels.iter().find(|label| !seen.insert(label.as_str())) {
            return Err(ExporterError::config_load(
                origin,
                format!("context '{}': duplicate label '{}'", self.context, label),
            ));
        }

        Ok(MetricDefinition {
            context: self.context,
            labels: self.labels,
            metrics_desc: self.metricsdesc,
            metrics_type,
            metrics_buckets: self.metricsbuckets,
            field_to_append: self.fieldtoappend.filter(|f| !f.is_empty()),
            request: self.request,
            ignore_zero_result: self.ignorezeroresult,
        })
    }
}

/// File format, selected by file name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Toml,
    Yaml,
}

impl SourceFormat {
    pub fn detect(path: &Path) -> Self {
        if path.to_string_lossy().ends_with("toml") {
            SourceFormat::Toml
        } else {
            SourceFormat::Yaml
        }
    }
}

/// Decode a definition document.
///
/// `origin` only names the source in error messages.
pub fn parse_definitions(
    content: &str,
    format: SourceFormat,
    origin: &Path,
) -> Result<Vec<MetricDefinition>> {
    let document: RawDocument = match format {
        SourceFormat::Toml => {
            toml::from_str(content).map_err(|e| ExporterError::config_load(origin, e))?
        }
        SourceFormat::Yaml if content.trim().is_empty() => RawDocument::default(),
        SourceFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ExporterError::config_load(origin, e))?
        }
    };

    document
        .metric
        .into_iter()
        .map(|raw| raw.validate(origin))
        .collect()
}

/// Read and decode a definition file.
pub fn load_file(path: &Path) -> Result<Vec<MetricDefinition>> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ExporterError::config_load(path, e))?;
    parse_definitions(&content, SourceFormat::detect(path), path)
}

/// The embedded default definitions.
pub fn builtin_definitions() -> Result<Vec<MetricDefinition>> {
    parse_definitions(
        BUILTIN_DEFINITIONS,
        SourceFormat::Toml,
        Path::new("default-metrics.toml"),
    )
}
