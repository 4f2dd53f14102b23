//! DuckDB backend using an r2d2 connection pool.

use std::time::Duration;

use async_trait::async_trait;
use duckdb::types::{TimeUnit, Value};
use duckdb::DuckdbConnectionManager;
use parking_lot::RwLock;
use r2d2::Pool;
use tracing::{debug, info};

use super::{Database, DbError, QueryRows};
use crate::logging::mask_dsn;

/// Maximum wait for a pooled connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// DSN values that select an in-memory database.
const MEMORY_DSNS: [&str; 2] = ["", ":memory:"];

/// Pooled DuckDB handle.
///
/// `close` drops the pool; the next `ping` reports [`DbError::Closed`] until
/// `reconnect` builds a new one from the same DSN.
pub struct DuckDbPool {
    dsn: String,
    max_open: u32,
    max_idle: u32,
    pool: RwLock<Option<Pool<DuckdbConnectionManager>>>,
}

impl std::fmt::Debug for DuckDbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbPool")
            .field("dsn", &mask_dsn(&self.dsn))
            .field("max_open", &self.max_open)
            .field("max_idle", &self.max_idle)
            .field("closed", &self.pool.read().is_none())
            .finish()
    }
}

impl DuckDbPool {
    /// Open a pool. `max_idle` is clamped to `max_open`.
    pub fn connect(dsn: &str, max_open: u32, max_idle: u32) -> Result<Self, DbError> {
        let handle = Self {
            dsn: dsn.trim().to_string(),
            max_open: max_open.max(1),
            max_idle: max_idle.min(max_open.max(1)),
            pool: RwLock::new(None),
        };
        let pool = handle.build_pool()?;
        *handle.pool.write() = Some(pool);
        Ok(handle)
    }

    /// Drop every pooled connection.
    pub fn close(&self) {
        if self.pool.write().take().is_some() {
            info!(dsn = %mask_dsn(&self.dsn), "Database pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.read().is_none()
    }

    fn build_pool(&self) -> Result<Pool<DuckdbConnectionManager>, DbError> {
        debug!(dsn = %mask_dsn(&self.dsn), "Launching connection");
        let manager = if MEMORY_DSNS.contains(&self.dsn.as_str()) {
            DuckdbConnectionManager::memory()?
        } else {
            DuckdbConnectionManager::file(&self.dsn)?
        };

        debug!(max_open = self.max_open, max_idle = self.max_idle, "Sizing connection pool");
        let pool = Pool::builder()
            .max_size(self.max_open)
            .min_idle(Some(self.max_idle))
            .connection_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build(manager)?;

        debug!(dsn = %mask_dsn(&self.dsn), "Successfully connected");
        Ok(pool)
    }

    fn current(&self) -> Result<Pool<DuckdbConnectionManager>, DbError> {
        self.pool.read().clone().ok_or(DbError::Closed)
    }
}

#[async_trait]
impl Database for DuckDbPool {
    async fn ping(&self) -> Result<(), DbError> {
        let pool = self.current()?;
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let conn = pool.get()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;
            Ok(())
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))?
    }

    async fn reconnect(&self) -> Result<(), DbError> {
        let pool = self.build_pool()?;
        *self.pool.write() = Some(pool);
        info!(dsn = %mask_dsn(&self.dsn), "Reconnected to database");
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<QueryRows, DbError> {
        let pool = self.current()?;
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || -> Result<QueryRows, DbError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let columns = rows
                .as_ref()
                .map(|stmt| stmt.column_names())
                .unwrap_or_default();

            let mut result = QueryRows {
                columns,
                rows: Vec::new(),
            };
            while let Some(row) = rows.next()? {
                let mut cells = Vec::with_capacity(result.columns.len());
                for idx in 0..result.columns.len() {
                    cells.push(stringify(row.get::<_, Value>(idx)?));
                }
                result.rows.push(cells);
            }
            Ok(result)
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))?
    }
}

/// Uniform textual form of a driver value.
fn stringify(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::HugeInt(v) => v.to_string(),
        Value::UTinyInt(v) => v.to_string(),
        Value::USmallInt(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::UBigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Decimal(v) => v.to_string(),
        Value::Text(s) => s,
        // Temporal values become seconds: timestamps and dates since the
        // epoch, times of day in the `+D HH:MM:SS` interval form.
        Value::Timestamp(unit, v) => unit_seconds(unit, v).to_string(),
        Value::Date32(days) => (i64::from(days) * SECONDS_PER_DAY).to_string(),
        Value::Time64(unit, v) => time_of_day(unit_seconds(unit, v)),
        other => format!("{:?}", other),
    }
}

const SECONDS_PER_DAY: i64 = 86_400;

fn unit_seconds(unit: TimeUnit, raw: i64) -> f64 {
    let raw = raw as f64;
    match unit {
        TimeUnit::Second => raw,
        TimeUnit::Millisecond => raw / 1e3,
        TimeUnit::Microsecond => raw / 1e6,
        TimeUnit::Nanosecond => raw / 1e9,
    }
}

fn time_of_day(seconds: f64) -> String {
    if seconds.fract() != 0.0 || seconds < 0.0 {
        return seconds.to_string();
    }
    let whole = seconds as i64;
    let days = whole / SECONDS_PER_DAY;
    let rest = whole % SECONDS_PER_DAY;
    format!(
        "+{:02} {:02}:{:02}:{:02}",
        days,
        rest / 3600,
        rest % 3600 / 60,
        rest % 60
    )
}
