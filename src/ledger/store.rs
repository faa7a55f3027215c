//! Clock Ledger
//!
//! Per-user append-only version log backed by SQLite. Every mutation
//! writes exactly one clock record and one typed record and bumps the
//! user's clock by one inside a single transaction, so
//! `clock == count(clock_records) == max(clock_records.clock)` always holds.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::record::{Clock, ClockInfo, ClockRecord, NewRecord, Record, UserExport};
use crate::error::{Error, Result};

const RECORD_COLUMNS: &str = "clock, source_table, content_hash, payload, skipped, created_at";

/// Persistent clock ledger backed by SQLite
pub struct ClockLedger {
    /// Single connection; holding the lock makes every append single-writer
    conn: Mutex<Connection>,
    /// Maximum clock values returned by one export
    max_export_range: u64,
}

impl ClockLedger {
    /// Create or open the ledger database
    pub fn open(data_dir: &Path, max_export_range: u64) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("ledger.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS users (
                user_key TEXT PRIMARY KEY,
                clock INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clock_records (
                user_key TEXT NOT NULL,
                clock INTEGER NOT NULL,
                source_table TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_key, clock)
            );

            CREATE TABLE IF NOT EXISTS records (
                user_key TEXT NOT NULL,
                clock INTEGER NOT NULL,
                source_table TEXT NOT NULL,
                content_hash TEXT,
                payload TEXT NOT NULL,
                skipped INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_key, clock)
            );

            CREATE INDEX IF NOT EXISTS idx_records_skipped
                ON records(user_key) WHERE skipped = 1;
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_export_range: max_export_range.max(2),
        })
    }

    /// Configured export page size
    pub fn max_export_range(&self) -> u64 {
        self.max_export_range
    }

    /// Current clock for a user (0 if unknown)
    pub async fn clock(&self, user_key: &str) -> Result<Clock> {
        let conn = self.conn.lock().await;
        Ok(user_row(&conn, user_key)?.map(|(clock, _)| clock).unwrap_or(0))
    }

    /// Current clocks for many users; unknown users report 0
    pub async fn clocks(&self, user_keys: &[String]) -> Result<HashMap<String, Clock>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT clock FROM users WHERE user_key = ?1")?;

        let mut clocks = HashMap::with_capacity(user_keys.len());
        for key in user_keys {
            let result: std::result::Result<i64, _> = stmt.query_row(params![key], |row| row.get(0));
            let clock = match result {
                Ok(clock) => clock as Clock,
                Err(rusqlite::Error::QueryReturnedNoRows) => 0,
                Err(e) => return Err(e.into()),
            };
            clocks.insert(key.clone(), clock);
        }
        Ok(clocks)
    }

    /// Whether the ledger holds any state for a user
    pub async fn user_exists(&self, user_key: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        Ok(user_row(&conn, user_key)?.is_some())
    }

    /// Append one mutation, returning its clock value
    pub async fn append(&self, user_key: &str, new: NewRecord) -> Result<Clock> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let current = match user_row(&tx, user_key)? {
            Some((clock, _)) => clock,
            None => {
                insert_user(&tx, user_key, now)?;
                0
            }
        };

        let record = Record {
            clock: current + 1,
            source_table: new.source_table,
            content_hash: new.content_hash,
            payload: new.payload,
            skipped: false,
            created_at: now,
        };
        insert_entry(&tx, user_key, &record)?;
        set_clock(&tx, user_key, record.clock, now)?;
        tx.commit()?;

        tracing::debug!(user = user_key, clock = record.clock, table = %record.source_table, "Appended record");
        Ok(record.clock)
    }

    /// Export clock records and records with `clock_range_min <= clock <= clock_range_min + range - 1`
    ///
    /// Returns `None` for unknown users. Fails with [`Error::Consistency`]
    /// when the user's clock disagrees with its clock records.
    pub async fn export_range(&self, user_key: &str, clock_range_min: Clock) -> Result<Option<UserExport>> {
        let clock_range_max = clock_range_min.saturating_add(self.max_export_range - 1);
        let conn = self.conn.lock().await;

        let (clock, created_at) = match user_row(&conn, user_key)? {
            Some(row) => row,
            None => return Ok(None),
        };

        let (count, max_clock_record): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(clock) FROM clock_records WHERE user_key = ?1",
            params![user_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let max_clock_record = max_clock_record.unwrap_or(0) as Clock;

        if count as Clock != clock || max_clock_record != clock {
            return Err(Error::Consistency(format!(
                "Cannot export - exported data is not consistent. Exported max clock val = {} and \
                 exported max ClockRecord val {} ({} clock records). Fix inconsistency in underlying \
                 data before proceeding.",
                clock, max_clock_record, count
            )));
        }

        // Clocks are stored as i64; nothing can sit above i64::MAX
        let (clock_records, records) = match i64::try_from(clock_range_min) {
            Err(_) => (Vec::new(), Vec::new()),
            Ok(min) => {
                let max = i64::try_from(clock_range_max).unwrap_or(i64::MAX);

                let mut stmt = conn.prepare_cached(
                    "SELECT clock, source_table, created_at FROM clock_records \
                     WHERE user_key = ?1 AND clock >= ?2 AND clock <= ?3 ORDER BY clock",
                )?;
                let clock_records = stmt
                    .query_map(params![user_key, min, max], |row| {
                        Ok(ClockRecord {
                            user_key: user_key.to_string(),
                            clock: row.get::<_, i64>(0)? as Clock,
                            source_table: parse_source_table(1, row.get(1)?)?,
                            created_at: parse_time(2, row.get(2)?)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM records WHERE user_key = ?1 AND clock >= ?2 AND clock <= ?3 ORDER BY clock",
                    RECORD_COLUMNS
                ))?;
                let records = stmt
                    .query_map(params![user_key, min, max], record_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                (clock_records, records)
            }
        };

        if records.len() != clock_records.len() {
            return Err(Error::Consistency(format!(
                "Cannot export - {} records do not match {} clock records for {}",
                records.len(),
                clock_records.len(),
                user_key
            )));
        }

        Ok(Some(UserExport {
            wallet: user_key.to_string(),
            clock,
            created_at,
            records,
            clock_records,
            clock_info: ClockInfo {
                requested_clock_range_min: clock_range_min,
                requested_clock_range_max: clock_range_max,
                local_clock_max: clock.min(clock_range_max),
            },
        }))
    }

    /// Persist an ordered page of replicated records in one transaction
    ///
    /// The first record must sit at `current clock + 1` and the rest must
    /// follow contiguously; otherwise nothing is written. Returns the new clock.
    pub async fn import_page(
        &self,
        user_key: &str,
        user_created_at: DateTime<Utc>,
        records: &[Record],
    ) -> Result<Clock> {
        let mut conn = self.conn.lock().await;

        let current = user_row(&conn, user_key)?.map(|(clock, _)| clock);
        if records.is_empty() {
            return Ok(current.unwrap_or(0));
        }

        let tx = conn.transaction()?;
        if current.is_none() {
            insert_user(&tx, user_key, user_created_at)?;
        }

        let mut expected = current.unwrap_or(0) + 1;
        for record in records {
            if record.clock != expected {
                return Err(Error::Replication(format!(
                    "Cannot import - records for {} are not contiguous: expected clock {}, got {}",
                    user_key, expected, record.clock
                )));
            }
            insert_entry(&tx, user_key, record)?;
            expected += 1;
        }

        let clock = expected - 1;
        set_clock(&tx, user_key, clock, Utc::now())?;
        tx.commit()?;

        Ok(clock)
    }

    /// Delete all state for a user
    pub async fn wipe(&self, user_key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM records WHERE user_key = ?1", params![user_key])?;
        tx.execute("DELETE FROM clock_records WHERE user_key = ?1", params![user_key])?;
        tx.execute("DELETE FROM users WHERE user_key = ?1", params![user_key])?;
        tx.commit()?;

        tracing::warn!(user = user_key, "Wiped local user state");
        Ok(())
    }

    /// Records with `from <= clock <= to`, in clock order
    pub async fn records_between(&self, user_key: &str, from: Clock, to: Clock) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM records WHERE user_key = ?1 AND clock >= ?2 AND clock <= ?3 ORDER BY clock",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![user_key, from as i64, to as i64], record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record written at a clock value
    pub async fn record_at(&self, user_key: &str, clock: Clock) -> Result<Option<Record>> {
        Ok(self.records_between(user_key, clock, clock).await?.pop())
    }

    /// Records whose content could not be fetched
    pub async fn skipped_records(&self, user_key: &str) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM records WHERE user_key = ?1 AND skipped = 1 ORDER BY clock",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![user_key], record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Clear the skipped flag once content has been recovered
    pub async fn mark_recovered(&self, user_key: &str, clock: Clock) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE records SET skipped = 0 WHERE user_key = ?1 AND clock = ?2",
            params![user_key, clock as i64],
        )?;
        Ok(())
    }

    /// All users with local state
    pub async fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT user_key FROM users ORDER BY user_key")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(users)
    }
}

fn user_row(conn: &Connection, user_key: &str) -> Result<Option<(Clock, DateTime<Utc>)>> {
    let result = conn.query_row(
        "SELECT clock, created_at FROM users WHERE user_key = ?1",
        params![user_key],
        |row| Ok((row.get::<_, i64>(0)? as Clock, parse_time(1, row.get(1)?)?)),
    );

    match result {
        Ok(row) => Ok(Some(row)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::State(format!("Failed to read user {}: {}", user_key, e))),
    }
}

fn insert_user(conn: &Connection, user_key: &str, created_at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO users (user_key, clock, created_at, updated_at) VALUES (?1, 0, ?2, ?2)",
        params![user_key, created_at.to_rfc3339()],
    )?;
    Ok(())
}

fn set_clock(conn: &Connection, user_key: &str, clock: Clock, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE users SET clock = ?2, updated_at = ?3 WHERE user_key = ?1",
        params![user_key, clock as i64, now.to_rfc3339()],
    )?;
    Ok(())
}

fn insert_entry(conn: &Connection, user_key: &str, record: &Record) -> Result<()> {
    let created_at = record.created_at.to_rfc3339();
    conn.execute(
        "INSERT INTO clock_records (user_key, clock, source_table, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![user_key, record.clock as i64, record.source_table.as_str(), created_at],
    )?;
    conn.execute(
        "INSERT INTO records (user_key, clock, source_table, content_hash, payload, skipped, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_key,
            record.clock as i64,
            record.source_table.as_str(),
            record.content_hash,
            record.payload.to_string(),
            record.skipped,
            created_at,
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let payload: String = row.get(3)?;
    Ok(Record {
        clock: row.get::<_, i64>(0)? as Clock,
        source_table: parse_source_table(1, row.get(1)?)?,
        content_hash: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(3, e))?,
        skipped: row.get(4)?,
        created_at: parse_time(5, row.get(5)?)?,
    })
}

fn parse_source_table(idx: usize, value: String) -> rusqlite::Result<super::SourceTable> {
    value.parse().map_err(|e: Error| conversion_error(idx, e))
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(e.to_string())
    }
}
