//! Raw per-counter readings: the source trait, a SQLite store and an in-memory source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const COUNTER_INFO_TABLE: &str = "counter_info";
const RAW_CONSUMPTION_TABLE: &str = "counter_raw_consumption";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Accepted on read; fractional seconds are optional in both.
const READ_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub counter_id: i64,
    pub timestamp: NaiveDateTime,
    pub consumption: Option<f64>,
}

impl Reading {
    pub fn new(counter_id: i64, timestamp: NaiveDateTime, consumption: Option<f64>) -> Self {
        Self {
            counter_id,
            timestamp,
            consumption: consumption.filter(|value| value.is_finite()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reading store not found at {0}")]
    StoreNotFound(PathBuf),
    #[error("reading store is missing table {0}")]
    MissingTable(&'static str),
    #[error("counter {counter_id} has unparseable timestamp '{value}'")]
    InvalidTimestamp { counter_id: i64, value: String },
    #[error("counter {counter_id} has no readings")]
    EmptySource { counter_id: i64 },
}

impl SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Sqlite(_))
    }
}

/// Read access to raw counter readings.
pub trait ReadingSource {
    fn list_counter_ids(&self) -> Result<Vec<i64>, SourceError>;

    fn fetch_readings(&self, counter_id: i64) -> Result<Vec<Reading>, SourceError>;

    fn first_timestamp(&self, counter_id: i64) -> Result<NaiveDateTime, SourceError>;

    fn last_timestamp(&self, counter_id: i64) -> Result<NaiveDateTime, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

/// Runs `f` until it succeeds, fails with a non-transient error, or retries run out.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut f: impl FnMut() -> Result<T, SourceError>,
) -> Result<T, SourceError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() || attempt >= policy.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = policy.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "store",
                    event = "source.retry",
                    operation,
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

/// SQLite-backed store laid out as a counter registry plus raw hourly readings.
pub struct SqliteReadingStore {
    conn: Connection,
}

impl SqliteReadingStore {
    /// Opens or creates a writable store, creating the schema when absent.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        create_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Opens an existing store without creating files or tables.
    pub fn open_existing(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::StoreNotFound(path.to_path_buf()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        for table in [COUNTER_INFO_TABLE, RAW_CONSUMPTION_TABLE] {
            if !table_exists(&conn, table)? {
                return Err(SourceError::MissingTable(table));
            }
        }
        Ok(Self { conn })
    }

    pub fn register_counter(&mut self, counter_id: i64) -> Result<(), SourceError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO counter_info (counter_id) VALUES (?1)",
            params![counter_id],
        )?;
        Ok(())
    }

    /// Upserts readings, registering every counter they mention.
    pub fn upsert_readings(&mut self, readings: &[Reading]) -> Result<(), SourceError> {
        if readings.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut register =
                tx.prepare("INSERT OR IGNORE INTO counter_info (counter_id) VALUES (?1)")?;
            let mut upsert = tx.prepare(
                "
                INSERT INTO counter_raw_consumption (counterinfo_id, timestamp, consumption)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(counterinfo_id, timestamp) DO UPDATE SET
                    consumption = excluded.consumption
                ",
            )?;

            for reading in readings {
                register.execute(params![reading.counter_id])?;
                upsert.execute(params![
                    reading.counter_id,
                    format_timestamp(reading.timestamp),
                    reading.consumption,
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            component = "store",
            event = "store.upsert",
            readings = readings.len()
        );
        Ok(())
    }

    fn boundary_timestamp(
        &self,
        counter_id: i64,
        sql: &str,
    ) -> Result<NaiveDateTime, SourceError> {
        let raw: Option<String> = self
            .conn
            .query_row(sql, params![counter_id], |row| row.get(0))
            .optional()?;
        let raw = raw.ok_or(SourceError::EmptySource { counter_id })?;
        parse_timestamp(counter_id, &raw)
    }
}

impl ReadingSource for SqliteReadingStore {
    fn list_counter_ids(&self) -> Result<Vec<i64>, SourceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT counter_id FROM counter_info ORDER BY counter_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn fetch_readings(&self, counter_id: i64) -> Result<Vec<Reading>, SourceError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT timestamp, consumption
            FROM counter_raw_consumption
            WHERE counterinfo_id = ?1
            ORDER BY timestamp ASC
            ",
        )?;
        let rows = stmt.query_map(params![counter_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
        })?;

        let mut readings = Vec::new();
        for row in rows {
            let (raw_ts, consumption) = row?;
            let timestamp = parse_timestamp(counter_id, &raw_ts)?;
            readings.push(Reading::new(counter_id, timestamp, consumption));
        }
        Ok(readings)
    }

    fn first_timestamp(&self, counter_id: i64) -> Result<NaiveDateTime, SourceError> {
        self.boundary_timestamp(
            counter_id,
            "
            SELECT timestamp FROM counter_raw_consumption
            WHERE counterinfo_id = ?1
            ORDER BY timestamp ASC
            LIMIT 1
            ",
        )
    }

    fn last_timestamp(&self, counter_id: i64) -> Result<NaiveDateTime, SourceError> {
        self.boundary_timestamp(
            counter_id,
            "
            SELECT timestamp FROM counter_raw_consumption
            WHERE counterinfo_id = ?1
            ORDER BY timestamp DESC
            LIMIT 1
            ",
        )
    }
}

/// Source backed by in-process vectors; counters are listed in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReadingSource {
    order: Vec<i64>,
    readings: HashMap<i64, Vec<Reading>>,
}

impl InMemoryReadingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counter(mut self, counter_id: i64, readings: Vec<Reading>) -> Self {
        if !self.readings.contains_key(&counter_id) {
            self.order.push(counter_id);
        }
        self.readings.entry(counter_id).or_default().extend(readings);
        self
    }

    fn counter_readings(&self, counter_id: i64) -> &[Reading] {
        self.readings
            .get(&counter_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl ReadingSource for InMemoryReadingSource {
    fn list_counter_ids(&self) -> Result<Vec<i64>, SourceError> {
        Ok(self.order.clone())
    }

    fn fetch_readings(&self, counter_id: i64) -> Result<Vec<Reading>, SourceError> {
        Ok(self.counter_readings(counter_id).to_vec())
    }

    fn first_timestamp(&self, counter_id: i64) -> Result<NaiveDateTime, SourceError> {
        self.counter_readings(counter_id)
            .iter()
            .map(|reading| reading.timestamp)
            .min()
            .ok_or(SourceError::EmptySource { counter_id })
    }

    fn last_timestamp(&self, counter_id: i64) -> Result<NaiveDateTime, SourceError> {
        self.counter_readings(counter_id)
            .iter()
            .map(|reading| reading.timestamp)
            .max()
            .ok_or(SourceError::EmptySource { counter_id })
    }
}

fn create_schema(conn: &Connection) -> Result<(), SourceError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS counter_info (
            counter_id INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS counter_raw_consumption (
            counterinfo_id INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            consumption REAL,
            PRIMARY KEY(counterinfo_id, timestamp)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, SourceError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(counter_id: i64, raw: &str) -> Result<NaiveDateTime, SourceError> {
    let trimmed = raw.trim();
    READ_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| SourceError::InvalidTimestamp {
            counter_id,
            value: raw.to_string(),
        })
}
