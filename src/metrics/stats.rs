//! Exporter self-metrics reported after every scrape cycle.

use std::time::Duration;

use prometheus::core::Collector;
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts};

use super::{HistogramData, Sample};
use crate::definitions::MetricKind;
use crate::Result;

const SUBSYSTEM: &str = "exporter";

/// Scrape bookkeeping owned by one coordinator.
#[derive(Debug, Clone)]
pub struct ScrapeStats {
    duration: Gauge,
    total_scrapes: IntCounter,
    error: IntGauge,
    scrape_errors: IntCounterVec,
    up: IntGauge,
}

impl ScrapeStats {
    pub fn new(namespace: &str) -> Result<Self> {
        Ok(Self {
            duration: Gauge::with_opts(
                Opts::new(
                    "last_scrape_duration_seconds",
                    "Duration of the last scrape of metrics from the database.",
                )
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
            )?,
            total_scrapes: IntCounter::with_opts(
                Opts::new(
                    "scrapes_total",
                    "Total number of times the database was scraped for metrics.",
                )
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
            )?,
            error: IntGauge::with_opts(
                Opts::new(
                    "last_scrape_error",
                    "Whether the last scrape of metrics resulted in an error (1 for error, 0 for success).",
                )
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
            )?,
            scrape_errors: IntCounterVec::new(
                Opts::new(
                    "scrape_errors_total",
                    "Total number of times an error occurred scraping a metric definition.",
                )
                .namespace(namespace)
                .subsystem(SUBSYSTEM),
                &["collector"],
            )?,
            up: IntGauge::with_opts(
                Opts::new("up", "Whether the database server is up.").namespace(namespace),
            )?,
        })
    }

    pub fn begin_cycle(&self) {
        self.total_scrapes.inc();
    }

    pub fn finish_cycle(&self, elapsed: Duration, failed: bool) {
        self.duration.set(elapsed.as_secs_f64());
        self.error.set(i64::from(failed));
    }

    pub fn set_up(&self, up: bool) {
        self.up.set(i64::from(up));
    }

    pub fn record_failure(&self, context: &str) {
        self.scrape_errors.with_label_values(&[context]).inc();
    }

    pub fn scrapes(&self) -> u64 {
        self.total_scrapes.get()
    }

    pub fn is_up(&self) -> bool {
        self.up.get() == 1
    }

    pub fn last_failed(&self) -> bool {
        self.error.get() == 1
    }

    pub fn failures(&self, context: &str) -> u64 {
        self.scrape_errors.with_label_values(&[context]).get()
    }

    /// Current values as samples, in the order the cycle reports them.
    pub fn samples(&self) -> Vec<Sample> {
        let mut families = Vec::new();
        families.extend(self.duration.collect());
        families.extend(self.total_scrapes.collect());
        families.extend(self.error.collect());
        families.extend(self.scrape_errors.collect());
        families.extend(self.up.collect());
        families_to_samples(families)
    }
}

/// Flatten collected metric families into samples.
pub(crate) fn families_to_samples(families: Vec<MetricFamily>) -> Vec<Sample> {
    let mut samples = Vec::new();
    for family in families {
        for metric in family.get_metric() {
            let labels = metric
                .get_label()
                .iter()
                .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                .collect();

            let sample = match family.get_field_type() {
                MetricType::COUNTER => Sample::scalar(
                    family.get_name(),
                    family.get_help(),
                    MetricKind::Counter,
                    metric.get_counter().get_value(),
                ),
                MetricType::HISTOGRAM => {
                    let histogram = metric.get_histogram();
                    Sample::histogram(
                        family.get_name(),
                        family.get_help(),
                        HistogramData {
                            count: histogram.get_sample_count(),
                            sum: histogram.get_sample_sum(),
                            buckets: histogram
                                .get_bucket()
                                .iter()
                                .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
                                .collect(),
                        },
                    )
                }
                _ => Sample::scalar(
                    family.get_name(),
                    family.get_help(),
                    MetricKind::Gauge,
                    metric.get_gauge().get_value(),
                ),
            };
            samples.push(sample.with_labels(labels));
        }
    }
    samples
}
