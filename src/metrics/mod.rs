//! Samples produced by a scrape and their exposition.

mod exposition;
mod stats;

pub use exposition::{encode_text, to_families, TEXT_CONTENT_TYPE};
pub use stats::ScrapeStats;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc;

use crate::definitions::MetricKind;

/// Histogram payload of a sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramData {
    pub count: u64,
    pub sum: f64,
    /// Upper bound -> cumulative count, ascending by bound.
    pub buckets: Vec<(f64, u64)>,
}

/// One constant sample ready for exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Vec<(String, String)>,
    pub histogram: Option<HistogramData>,
}

impl Sample {
    pub fn scalar(name: impl Into<String>, help: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            value,
            labels: Vec::new(),
            histogram: None,
        }
    }

    pub fn histogram(name: impl Into<String>, help: impl Into<String>, data: HistogramData) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind: MetricKind::Histogram,
            value: data.sum,
            labels: Vec::new(),
            histogram: Some(data),
        }
    }

    pub fn with_labels(mut self, labels: Vec<(String, String)>) -> Self {
        self.labels = labels;
        self
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Destination of samples. Definitions run concurrently, so arrivals from
/// different definitions interleave.
pub type SampleSink = mpsc::UnboundedSender<Sample>;

/// Join non-empty name parts with `_`.
pub fn fq_name(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

lazy_static! {
    static ref METRIC_NAME: Regex = Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap();
    static ref LABEL_NAME: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
}

pub fn is_valid_metric_name(name: &str) -> bool {
    METRIC_NAME.is_match(name)
}

/// Label names starting with `__` are reserved for Prometheus.
pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME.is_match(name) && !name.starts_with("__")
}
