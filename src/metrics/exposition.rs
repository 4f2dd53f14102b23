//! Prometheus text exposition of samples.

use std::collections::BTreeMap;

use prometheus::proto::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType,
};
use prometheus::{Encoder, TextEncoder};
use tracing::warn;

use super::Sample;
use crate::definitions::MetricKind;
use crate::{ExporterError, Result};

fn metric_type(kind: MetricKind) -> MetricType {
    match kind {
        MetricKind::Gauge => MetricType::GAUGE,
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Histogram => MetricType::HISTOGRAM,
    }
}

fn to_metric(sample: &Sample) -> Metric {
    let mut metric = Metric::default();
    for (name, value) in &sample.labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }

    match (sample.kind, &sample.histogram) {
        (MetricKind::Histogram, Some(data)) => {
            let mut histogram = Histogram::default();
            histogram.set_sample_count(data.count);
            histogram.set_sample_sum(data.sum);
            for (upper_bound, count) in &data.buckets {
                let mut bucket = Bucket::default();
                bucket.set_upper_bound(*upper_bound);
                bucket.set_cumulative_count(*count);
                histogram.mut_bucket().push(bucket);
            }
            metric.set_histogram(histogram);
        }
        (MetricKind::Counter, _) => {
            let mut counter = Counter::default();
            counter.set_value(sample.value);
            metric.set_counter(counter);
        }
        _ => {
            let mut gauge = Gauge::default();
            gauge.set_value(sample.value);
            metric.set_gauge(gauge);
        }
    }
    metric
}

/// Group samples into metric families, sorted by name.
///
/// The first sample of a name fixes the family's help and type; later
/// samples of another type are dropped.
pub fn to_families(samples: &[Sample]) -> Vec<MetricFamily> {
    let mut families: BTreeMap<&str, MetricFamily> = BTreeMap::new();

    for sample in samples {
        let family = families.entry(sample.name.as_str()).or_insert_with(|| {
            let mut family = MetricFamily::default();
            family.set_name(sample.name.clone());
            family.set_help(sample.help.clone());
            family.set_field_type(metric_type(sample.kind));
            family
        });

        if family.get_field_type() != metric_type(sample.kind) {
            warn!(
                metric = %sample.name,
                kind = %sample.kind,
                "Sample type conflicts with an earlier sample of the same name, dropping"
            );
            continue;
        }
        family.mut_metric().push(to_metric(sample));
    }

    families.into_values().collect()
}

/// Encode samples plus already-built families in the text format.
pub fn encode_text(samples: &[Sample], extra: Vec<MetricFamily>) -> Result<String> {
    let mut families = to_families(samples);
    families.extend(extra.into_iter().filter(|mf| !mf.get_metric().is_empty()));

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| ExporterError::Encoding(e.to_string()))
}

/// Text format content type.
pub const TEXT_CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::HistogramData;

    #[test]
    fn test_samples_grouped_by_name() {
        let samples = vec![
            Sample::scalar("duckdb_sessions_value", "Sessions.", MetricKind::Gauge, 1.0)
                .with_labels(vec![("host".into(), "a".into())]),
            Sample::scalar("duckdb_sessions_value", "Sessions.", MetricKind::Gauge, 2.0)
                .with_labels(vec![("host".into(), "b".into())]),
            Sample::scalar("duckdb_calls_total", "Calls.", MetricKind::Counter, 7.0),
        ];

        let families = to_families(&samples);
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].get_name(), "duckdb_calls_total");
        assert_eq!(families[1].get_metric().len(), 2);
    }

    #[test]
    fn test_conflicting_kind_is_dropped() {
        let samples = vec![
            Sample::scalar("duckdb_x", "x", MetricKind::Gauge, 1.0),
            Sample::scalar("duckdb_x", "x", MetricKind::Counter, 2.0),
        ];
        let families = to_families(&samples);
        assert_eq!(families[0].get_metric().len(), 1);
    }

    #[test]
    fn test_encode_text() {
        let samples = vec![
            Sample::scalar("duckdb_sessions_value", "Sessions.", MetricKind::Gauge, 2.0)
                .with_labels(vec![("host".into(), "a".into())]),
            Sample::histogram(
                "duckdb_latency_duration",
                "Latency.",
                HistogramData {
                    count: 10,
                    sum: 12.5,
                    buckets: vec![(1.0, 3), (5.0, 9)],
                },
            ),
        ];

        let text = encode_text(&samples, Vec::new()).unwrap();
        assert!(text.contains("# TYPE duckdb_sessions_value gauge"));
        assert!(text.contains("duckdb_sessions_value{host=\"a\"} 2"));
        assert!(text.contains("duckdb_latency_duration_bucket{le=\"1\"} 3"));
        assert!(text.contains("duckdb_latency_duration_bucket{le=\"5\"} 9"));
        assert!(text.contains("duckdb_latency_duration_bucket{le=\"+Inf\"} 10"));
        assert!(text.contains("duckdb_latency_duration_sum 12.5"));
        assert!(text.contains("duckdb_latency_duration_count 10"));
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode_text(&[], Vec::new()).unwrap(), "");
    }
}
