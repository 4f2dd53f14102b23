//! Execution of a single metric definition.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, error};

use crate::coerce::{coerce, coerce_count};
use crate::db::Database;
use crate::definitions::{MetricDefinition, MetricKind};
use crate::metrics::{
    fq_name, is_valid_label_name, is_valid_metric_name, HistogramData, Sample, SampleSink,
};
use crate::{ExporterError, Result};

/// One fetched row keyed by lower-cased column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericRow(HashMap<String, String>);

impl GenericRow {
    pub fn new(columns: &[String], values: Vec<String>) -> Self {
        Self(
            columns
                .iter()
                .map(|c| c.to_lowercase())
                .zip(values)
                .collect(),
        )
    }

    /// Cell text; a missing column reads as empty.
    pub fn get(&self, column: &str) -> &str {
        self.0
            .get(&column.to_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Turn a cell value into a metric name fragment.
pub fn sanitize_name(raw: &str) -> String {
    raw.replace([' ', '-'], "_")
        .replace(['(', ')', '/', '*'], "")
        .to_lowercase()
}

/// Runs definitions against a database and streams the resulting samples.
#[derive(Debug, Clone)]
pub struct MetricExecutor {
    namespace: String,
    query_timeout: Duration,
}

impl MetricExecutor {
    pub fn new(namespace: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            query_timeout,
        }
    }

    /// Execute one definition, returning the number of samples emitted.
    ///
    /// Unconvertible values and broken histogram rows are logged and skipped;
    /// only validation, query and empty-result failures are returned.
    pub async fn execute(
        &self,
        db: &dyn Database,
        definition: &MetricDefinition,
        sink: &SampleSink,
    ) -> Result<usize> {
        debug!(
            context = %definition.context,
            labels = ?definition.labels,
            metrics_desc = ?definition.metrics_desc,
            metrics_type = ?definition.metrics_type,
            field_to_append = ?definition.field_to_append,
            ignore_zero_result = definition.ignore_zero_result,
            request = %definition.request,
            "About to scrape metric"
        );

        if definition.request.trim().is_empty() {
            let err = ExporterError::MissingRequest {
                context: definition.context.clone(),
            };
            error!(error = %err, "Did you forget to define request in your metrics config file?");
            return Err(err);
        }

        if definition.metrics_desc.is_empty() {
            let err = ExporterError::MissingDescriptors {
                context: definition.context.clone(),
            };
            error!(error = %err, "Did you forget to define metricsdesc in your metrics config file?");
            return Err(err);
        }

        let skipped = unbucketed_histograms(definition);

        let rows = match tokio::time::timeout(self.query_timeout, db.query(&definition.request)).await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(e)) => return Err(ExporterError::Query(e)),
            Err(_) => return Err(ExporterError::QueryTimeout(self.query_timeout)),
        };

        let mut emitted = 0;
        for values in rows.rows {
            let row = GenericRow::new(&rows.columns, values);
            for sample in self.row_samples(definition, &row, &skipped) {
                if sink.send(sample).is_err() {
                    debug!(context = %definition.context, "Sample receiver dropped");
                }
                emitted += 1;
            }
        }

        debug!(context = %definition.context, emitted, "Definition scraped");
        if emitted == 0 && !definition.ignore_zero_result {
            return Err(ExporterError::NoMetrics {
                context: definition.context.clone(),
            });
        }
        Ok(emitted)
    }

    fn row_samples(
        &self,
        definition: &MetricDefinition,
        row: &GenericRow,
        skipped: &HashSet<&str>,
    ) -> Vec<Sample> {
        let mut samples = Vec::new();

        for (column, help) in &definition.metrics_desc {
            if skipped.contains(column.as_str()) {
                continue;
            }

            let value = match coerce(row.get(column)) {
                Ok(value) => value,
                Err(e) => {
                    error!(
                        context = %definition.context,
                        metric = %column,
                        metric_help = %help,
                        error = %e,
                        "Unable to convert current value to float"
                    );
                    continue;
                }
            };

            let (name, labels): (String, Vec<(String, String)>) = match definition.appended_field() {
                None => (
                    fq_name(&[&self.namespace, &definition.context, column]),
                    definition
                        .labels
                        .iter()
                        .map(|label| (label.clone(), row.get(label).to_string()))
                        .collect(),
                ),
                Some(field) => (
                    fq_name(&[
                        &self.namespace,
                        &definition.context,
                        &sanitize_name(row.get(field)),
                    ]),
                    Vec::new(),
                ),
            };

            if !is_valid_metric_name(&name) {
                error!(
                    context = %definition.context,
                    metric = %column,
                    name = %name,
                    "Invalid metric name, skipping sample"
                );
                continue;
            }
            if let Some((label, _)) = labels.iter().find(|(label, _)| !is_valid_label_name(label)) {
                error!(
                    context = %definition.context,
                    metric = %column,
                    label = %label,
                    "Invalid label name, skipping sample"
                );
                continue;
            }

            let sample = match definition.kind_of(column) {
                MetricKind::Histogram => {
                    let Some(data) = build_histogram(definition, column, value, row) else {
                        continue;
                    };
                    Sample::histogram(name, help.clone(), data)
                }
                kind => Sample::scalar(name, help.clone(), kind, value),
            };
            samples.push(sample.with_labels(labels));
        }

        samples
    }
}

/// Histogram descriptors lacking a bucket table. They are reported and
/// skipped; the other descriptors of the definition still run.
fn unbucketed_histograms(definition: &MetricDefinition) -> HashSet<&str> {
    definition
        .metrics_desc
        .keys()
        .filter(|column| {
            definition.kind_of(column) == MetricKind::Histogram
                && !definition.metrics_buckets.contains_key(column.as_str())
        })
        .map(|column| {
            let err = ExporterError::MissingBucketConfig {
                context: definition.context.clone(),
                column: column.clone(),
            };
            error!(error = %err, "Unable to find MetricsBuckets configuration key for metric");
            column.as_str()
        })
        .collect()
}

fn build_histogram(
    definition: &MetricDefinition,
    column: &str,
    sum: f64,
    row: &GenericRow,
) -> Option<HistogramData> {
    let Some(count) = coerce_count(row.get("count")) else {
        error!(
            context = %definition.context,
            metric = %column,
            value = %row.get("count"),
            "Unable to convert count value to int"
        );
        return None;
    };

    let mut buckets = Vec::new();
    for (field, upper_bound) in definition.metrics_buckets.get(column)? {
        let Ok(bound) = upper_bound.trim().parse::<f64>() else {
            error!(
                context = %definition.context,
                metric = %column,
                bucket_limit = %upper_bound,
                "Unable to convert bucket limit value to float"
            );
            continue;
        };
        let Some(cumulative) = coerce_count(row.get(field)) else {
            error!(
                context = %definition.context,
                metric = %column,
                field = %field,
                value = %row.get(field),
                "Unable to convert bucket value to int"
            );
            continue;
        };
        buckets.push((bound, cumulative));
    }

    buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
    buckets.dedup_by(|later, earlier| later.0 == earlier.0);

    Some(HistogramData {
        count,
        sum,
        buckets,
    })
}
