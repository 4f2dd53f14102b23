//! Scrape cycles: connectivity check, definition reload, concurrent fan-out
//! over every definition, then the exporter's own bookkeeping samples.
//!
//! A single async mutex is held for the whole cycle, so at most one cycle is
//! in flight per [`Exporter`] whichever mode drives it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::executor::MetricExecutor;
use crate::config::ExporterConfig;
use crate::db::{Database, DbError};
use crate::definitions::MetricStore;
use crate::metrics::{Sample, SampleSink, ScrapeStats};
use crate::{ExporterError, Result};

/// How scrapes are triggered. Chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    /// Every pull runs a cycle and receives its samples directly.
    OnDemand,
    /// A timer runs cycles; pulls read the last completed snapshot.
    Scheduled(Duration),
}

/// Samples of the most recent scheduled cycle.
#[derive(Debug, Clone, Default)]
pub struct ScrapeSnapshot {
    pub samples: Arc<Vec<Sample>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A definition that failed during a cycle.
#[derive(Debug)]
pub struct DefinitionFailure {
    pub context: String,
    pub error: ExporterError,
}

/// Result of one cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub up: bool,
    pub emitted: usize,
    /// Set when the cycle ended early because the database was unreachable.
    pub connectivity: Option<ExporterError>,
    /// Failures in definition order.
    pub failures: Vec<DefinitionFailure>,
}

impl CycleOutcome {
    /// The error reported for the cycle: the connectivity failure, otherwise
    /// the failure of the last definition (in definition order) that failed.
    pub fn error(&self) -> Option<&ExporterError> {
        self.connectivity
            .as_ref()
            .or_else(|| self.failures.last().map(|failure| &failure.error))
    }
}

/// Owns the database handle, the definition store and the scrape lock.
pub struct Exporter {
    db: Arc<dyn Database>,
    executor: MetricExecutor,
    mode: ScrapeMode,
    stats: ScrapeStats,
    store: Mutex<MetricStore>,
    snapshot: RwLock<ScrapeSnapshot>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("mode", &self.mode)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    /// Build an exporter. Fails if a definition source cannot be loaded.
    pub fn new(config: &ExporterConfig, db: Arc<dyn Database>) -> Result<Self> {
        let store = MetricStore::open(config.definition_sources())?;
        info!(
            definitions = store.active().len(),
            mode = ?config.scrape_mode(),
            "Exporter initialised"
        );

        Ok(Self {
            db,
            executor: MetricExecutor::new(config.namespace.clone(), config.query_timeout),
            mode: config.scrape_mode(),
            stats: ScrapeStats::new(&config.namespace)?,
            store: Mutex::new(store),
            snapshot: RwLock::new(ScrapeSnapshot::default()),
        })
    }

    pub fn mode(&self) -> ScrapeMode {
        self.mode
    }

    pub fn stats(&self) -> &ScrapeStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ScrapeSnapshot {
        self.snapshot.read().clone()
    }

    /// Run one cycle now, streaming every sample into `sink`.
    pub async fn scrape(&self, sink: &SampleSink) -> Result<CycleOutcome> {
        let mut store = self.store.lock().await;
        self.run_cycle(&mut store, sink).await
    }

    /// Pull interface: a fresh cycle in on-demand mode, the last snapshot in
    /// scheduled mode.
    pub async fn collect(&self) -> Result<Vec<Sample>> {
        if let ScrapeMode::Scheduled(_) = self.mode {
            let snapshot = self.snapshot();
            return Ok(snapshot.samples.as_ref().clone());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.scrape(&tx).await?;
        drop(tx);
        Ok(drain(&mut rx))
    }

    /// Run one cycle and replace the snapshot with its samples.
    pub async fn scheduled_scrape(&self) -> Result<CycleOutcome> {
        let mut store = self.store.lock().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = self.run_cycle(&mut store, &tx).await;
        drop(tx);

        let samples = drain(&mut rx);
        debug!(samples = samples.len(), "Storing scrape snapshot");
        *self.snapshot.write() = ScrapeSnapshot {
            samples: Arc::new(samples),
            completed_at: Some(Utc::now()),
        };
        outcome
    }

    /// Run scheduled cycles until `shutdown` flips to `true` or its sender
    /// is dropped. The first cycle starts immediately; a cycle in flight is
    /// always completed before stopping.
    pub async fn run_scheduled(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ScrapeMode::Scheduled(period) = self.mode else {
            return Err(ExporterError::Internal(
                "exporter is not configured for scheduled scrapes".to_string(),
            ));
        };

        info!(interval = ?period, "Starting scheduled scrapes");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scheduled_scrape().await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduled scrapes stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn run_cycle(&self, store: &mut MetricStore, sink: &SampleSink) -> Result<CycleOutcome> {
        let started = Instant::now();
        self.stats.begin_cycle();

        let result = self.cycle_body(store, sink).await;
        let failed = match &result {
            Ok(outcome) => outcome.error().is_some(),
            Err(_) => true,
        };
        self.stats.finish_cycle(started.elapsed(), failed);

        for sample in self.stats.samples() {
            if sink.send(sample).is_err() {
                debug!("Sample receiver dropped before metadata was sent");
                break;
            }
        }
        result
    }

    async fn cycle_body(&self, store: &mut MetricStore, sink: &SampleSink) -> Result<CycleOutcome> {
        if let Err(e) = self.connect().await {
            error!(error = %e, "Error pinging database");
            self.stats.set_up(false);
            return Ok(CycleOutcome {
                up: false,
                connectivity: Some(ExporterError::Connectivity(e)),
                ..Default::default()
            });
        }
        debug!("Successfully pinged database");
        self.stats.set_up(true);

        if store.changed() {
            store.reload()?;
        }

        let definitions = store.active();
        let handles: Vec<_> = definitions
            .iter()
            .map(|definition| {
                let db = Arc::clone(&self.db);
                let executor = self.executor.clone();
                let definition = Arc::clone(definition);
                let sink = sink.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = executor.execute(db.as_ref(), &definition, &sink).await;
                    (result, started.elapsed())
                })
            })
            .collect();

        let mut outcome = CycleOutcome {
            up: true,
            ..Default::default()
        };
        for (definition, joined) in definitions.iter().zip(join_all(handles).await) {
            let (result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => (Err(ExporterError::Internal(e.to_string())), Duration::ZERO),
            };

            match result {
                Ok(emitted) => {
                    debug!(
                        context = %definition.context,
                        emitted,
                        scrape_duration = ?elapsed,
                        "Successfully scraped metric"
                    );
                    outcome.emitted += emitted;
                }
                Err(e) => {
                    error!(
                        context = %definition.context,
                        scrape_duration = ?elapsed,
                        error = %e,
                        "Scrape of metric failed"
                    );
                    self.stats.record_failure(&definition.context);
                    outcome.failures.push(DefinitionFailure {
                        context: definition.context.clone(),
                        error: e,
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Ping, reconnecting once if the handle reports it was closed.
    async fn connect(&self) -> std::result::Result<(), DbError> {
        match self.db.ping().await {
            Err(DbError::Closed) => {
                warn!("Database handle closed, reconnecting");
                if let Err(e) = self.db.reconnect().await {
                    error!(error = %e, "Error reconnecting to database");
                }
                self.db.ping().await
            }
            other => other,
        }
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Sample>) -> Vec<Sample> {
    let mut samples = Vec::new();
    while let Ok(sample) = rx.try_recv() {
        samples.push(sample);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::StaticDatabase;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const SESSIONS: &str = r#"
[[metric]]
context = "sessions"
labels = ["host"]
metricsdesc = { value = "Active sessions." }
request = "sessions"
"#;

    const BROKEN: &str = r#"
[[metric]]
context = "first_broken"
metricsdesc = { value = "x" }
request = "missing_a"

[[metric]]
context = "ok"
metricsdesc = { value = "x" }
request = "sessions"

[[metric]]
context = "second_broken"
metricsdesc = { value = "x" }
request = "missing_b"
"#;

    fn write_defaults(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("defaults.toml");
        fs::write(&path, content).unwrap();
        path
    }

    fn exporter(db: Arc<StaticDatabase>, defaults: PathBuf, interval: Duration) -> Exporter {
        let config = ExporterConfig {
            default_metrics: Some(defaults),
            scrape_interval: interval,
            ..Default::default()
        };
        Exporter::new(&config, db).unwrap()
    }

    fn sessions_db() -> StaticDatabase {
        StaticDatabase::new().with_rows("sessions", &["host", "value"], &[&["a", "1"], &["b", "2"]])
    }

    fn find<'a>(samples: &'a [Sample], name: &str) -> Option<&'a Sample> {
        samples.iter().find(|s| s.name == name)
    }

    #[tokio::test]
    async fn test_on_demand_collect_streams_samples_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(
            Arc::new(sessions_db()),
            write_defaults(&dir, SESSIONS),
            Duration::ZERO,
        );

        let samples = exporter.collect().await.unwrap();
        let values: Vec<_> = samples
            .iter()
            .filter(|s| s.name == "duckdb_sessions_value")
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);

        assert_eq!(find(&samples, "duckdb_up").unwrap().value, 1.0);
        assert_eq!(find(&samples, "duckdb_exporter_last_scrape_error").unwrap().value, 0.0);
        assert_eq!(find(&samples, "duckdb_exporter_scrapes_total").unwrap().value, 1.0);
        assert!(find(&samples, "duckdb_exporter_last_scrape_duration_seconds").is_some());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_last_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(
            Arc::new(sessions_db()),
            write_defaults(&dir, BROKEN),
            Duration::ZERO,
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = exporter.scrape(&tx).await.unwrap();
        drop(tx);
        let samples = drain(&mut rx);

        assert!(outcome.up);
        assert_eq!(outcome.emitted, 2);
        let failed: Vec<_> = outcome.failures.iter().map(|f| f.context.as_str()).collect();
        assert_eq!(failed, vec!["first_broken", "second_broken"]);
        assert!(outcome.error().unwrap().to_string().contains("missing_b"));

        assert_eq!(exporter.stats().failures("first_broken"), 1);
        assert_eq!(exporter.stats().failures("ok"), 0);
        assert!(exporter.stats().last_failed());
        assert_eq!(samples.iter().filter(|s| s.name == "duckdb_ok_value").count(), 2);
        let error_counters = samples
            .iter()
            .filter(|s| s.name == "duckdb_exporter_scrape_errors_total")
            .count();
        assert_eq!(error_counters, 2);
    }

    #[tokio::test]
    async fn test_unreachable_database_yields_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sessions_db());
        db.set_unreachable(true);
        let exporter = exporter(db.clone(), write_defaults(&dir, SESSIONS), Duration::ZERO);

        let samples = exporter.collect().await.unwrap();
        assert!(find(&samples, "duckdb_sessions_value").is_none());
        assert_eq!(find(&samples, "duckdb_up").unwrap().value, 0.0);
        assert_eq!(find(&samples, "duckdb_exporter_last_scrape_error").unwrap().value, 1.0);
        assert_eq!(db.reconnects(), 0);

        // Recovered on the next cycle.
        db.set_unreachable(false);
        let samples = exporter.collect().await.unwrap();
        assert_eq!(find(&samples, "duckdb_up").unwrap().value, 1.0);
        assert_eq!(find(&samples, "duckdb_exporter_last_scrape_error").unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn test_closed_handle_is_reconnected_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sessions_db());
        db.close();
        let exporter = exporter(db.clone(), write_defaults(&dir, SESSIONS), Duration::ZERO);

        let samples = exporter.collect().await.unwrap();
        assert_eq!(db.reconnects(), 1);
        assert_eq!(find(&samples, "duckdb_up").unwrap().value, 1.0);
        assert!(find(&samples, "duckdb_sessions_value").is_some());
    }

    #[tokio::test]
    async fn test_cycles_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sessions_db().with_delay("sessions", Duration::from_millis(50)));
        let exporter = Arc::new(exporter(
            db.clone(),
            write_defaults(&dir, SESSIONS),
            Duration::ZERO,
        ));

        let (a, b, c) = tokio::join!(exporter.collect(), exporter.collect(), exporter.collect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(db.max_in_flight(), 1);
        assert_eq!(exporter.stats().scrapes(), 3);
    }

    #[tokio::test]
    async fn test_scheduled_and_direct_cycles_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sessions_db().with_delay("sessions", Duration::from_millis(50)));
        let exporter = exporter(
            db.clone(),
            write_defaults(&dir, SESSIONS),
            Duration::from_secs(60),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (scheduled, direct) = tokio::join!(exporter.scheduled_scrape(), exporter.scrape(&tx));
        drop(tx);

        assert!(scheduled.unwrap().error().is_none());
        assert!(direct.unwrap().error().is_none());
        assert_eq!(db.max_in_flight(), 1);
        assert_eq!(exporter.stats().scrapes(), 2);
        assert!(find(&exporter.snapshot().samples, "duckdb_sessions_value").is_some());
        assert!(find(&drain(&mut rx), "duckdb_sessions_value").is_some());
    }

    #[tokio::test]
    async fn test_scheduled_mode_serves_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(
            Arc::new(sessions_db()),
            write_defaults(&dir, SESSIONS),
            Duration::from_secs(60),
        );
        assert_eq!(exporter.mode(), ScrapeMode::Scheduled(Duration::from_secs(60)));

        // Nothing scraped yet.
        assert!(exporter.collect().await.unwrap().is_empty());

        exporter.scheduled_scrape().await.unwrap();
        let snapshot = exporter.snapshot();
        assert!(snapshot.completed_at.is_some());

        // Pulls read the snapshot without running a cycle.
        let first = exporter.collect().await.unwrap();
        let second = exporter.collect().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exporter.stats().scrapes(), 1);
        assert!(find(&first, "duckdb_sessions_value").is_some());
    }

    #[tokio::test]
    async fn test_run_scheduled_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Arc::new(exporter(
            Arc::new(sessions_db()),
            write_defaults(&dir, SESSIONS),
            Duration::from_millis(20),
        ));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move { exporter.run_scheduled(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(70)).await;
        tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        let scrapes = exporter.stats().scrapes();
        assert!(scrapes >= 2, "expected several cycles, got {}", scrapes);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.stats().scrapes(), scrapes);
    }

    #[tokio::test]
    async fn test_run_scheduled_requires_scheduled_mode() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(
            Arc::new(sessions_db()),
            write_defaults(&dir, SESSIONS),
            Duration::ZERO,
        );
        let (_tx, rx) = watch::channel(false);
        assert!(exporter.run_scheduled(rx).await.is_err());
    }

    #[tokio::test]
    async fn test_custom_source_change_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom.toml");
        fs::write(&custom, SESSIONS).unwrap();

        let db = Arc::new(sessions_db().with_rows("extra", &["value"], &[&["9"]]));
        let config = ExporterConfig {
            default_metrics: Some(write_defaults(&dir, "")),
            custom_metrics: vec![custom.clone()],
            ..Default::default()
        };
        let exporter = Exporter::new(&config, db).unwrap();

        let samples = exporter.collect().await.unwrap();
        assert!(find(&samples, "duckdb_sessions_value").is_some());

        fs::write(
            &custom,
            "[[metric]]\ncontext = \"extra\"\nmetricsdesc = { value = \"x\" }\nrequest = \"extra\"\n",
        )
        .unwrap();
        let samples = exporter.collect().await.unwrap();
        assert!(find(&samples, "duckdb_sessions_value").is_none());
        assert_eq!(find(&samples, "duckdb_extra_value").unwrap().value, 9.0);
    }

    #[tokio::test]
    async fn test_broken_reload_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom.toml");
        fs::write(&custom, SESSIONS).unwrap();
        let config = ExporterConfig {
            default_metrics: Some(write_defaults(&dir, "")),
            custom_metrics: vec![custom.clone()],
            ..Default::default()
        };
        let exporter = Exporter::new(&config, Arc::new(sessions_db())).unwrap();
        exporter.collect().await.unwrap();

        fs::write(&custom, "[[metric]\n").unwrap();
        let err = exporter.collect().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
