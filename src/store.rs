//! Durable local storage for the event log, the A/B log and cached test choices.
//!
//! [`Store`] wraps a single SQLite connection behind a mutex, so all operations are serialized at
//! the connection level and can be called from any thread. The database is opened lazily on first
//! use. If it cannot be opened, the store is disabled for the rest of the process lifetime: reads
//! return empty results and writes return [`Error::StoreUnavailable`]. Callers that log telemetry
//! are expected to ignore write errors, as local persistence must never break the host
//! application.
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::json;

use crate::event::{
    Assignment, CachedChoice, LogEntry, ACTION_CHOSEN, ACTION_FAILURE, ACTION_GOAL,
};
use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    action TEXT NOT NULL,
    data_json TEXT
);
CREATE INDEX IF NOT EXISTS event_log_timestamp ON event_log (timestamp);

CREATE TABLE IF NOT EXISTS ab_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    action TEXT NOT NULL,
    data_json TEXT
);
CREATE INDEX IF NOT EXISTS ab_log_timestamp ON ab_log (timestamp);

CREATE TABLE IF NOT EXISTS ab_choices (
    test_name TEXT NOT NULL UNIQUE,
    choice INTEGER,
    num_choices INTEGER NOT NULL DEFAULT 0,
    has_data INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL
);
";

const INSTALLATION_ID_KEY: &str = "installation_id";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

enum Slot {
    Unopened,
    Open(Connection),
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
enum LogTable {
    Events,
    Ab,
}

impl LogTable {
    fn name(self) -> &'static str {
        match self {
            LogTable::Events => "event_log",
            LogTable::Ab => "ab_log",
        }
    }
}

/// Local persistent store backed by SQLite.
pub struct Store {
    location: Location,
    slot: Mutex<Slot>,
}

impl Store {
    /// Create a store backed by the database file at `path`. The file (and its parent directory)
    /// is created on first use.
    pub fn open(path: impl Into<PathBuf>) -> Store {
        Store {
            location: Location::File(path.into()),
            slot: Mutex::new(Slot::Unopened),
        }
    }

    /// Create a store backed by a private in-memory database.
    pub fn in_memory() -> Store {
        Store {
            location: Location::Memory,
            slot: Mutex::new(Slot::Unopened),
        }
    }

    /// Path of the database file, or `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Create tables and indexes if they don't exist yet. Idempotent.
    pub fn ensure_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }

    /// Append an entry to the event log.
    pub fn log(&self, action: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.with_connection(|conn| append(conn, LogTable::Events, action, data.as_ref()))
    }

    /// All event log entries in insertion order.
    pub fn get_logs(&self) -> Result<Vec<LogEntry>> {
        self.read_or(Vec::new(), |conn| entries(conn, LogTable::Events))
    }

    /// Delete event log entries with a timestamp before or equal to `before_or_equal_to`. Returns
    /// the number of deleted entries.
    pub fn delete_logs(&self, before_or_equal_to: DateTime<Utc>) -> Result<usize> {
        self.with_connection(|conn| purge(conn, LogTable::Events, before_or_equal_to))
    }

    /// Delete `last_uploaded` and every event log entry written before it. Entries written
    /// afterwards are kept even if the clock moved backwards in the meantime.
    pub fn delete_logs_through(&self, last_uploaded: &LogEntry) -> Result<usize> {
        self.with_connection(|conn| purge_through(conn, LogTable::Events, last_uploaded.id))
    }

    /// Persisted choice for `test_name`, or `None` if no decision has been made yet.
    pub fn get_cached_choice(&self, test_name: &str) -> Result<Option<usize>> {
        self.read_or(None, |conn| {
            Ok(cached_row(conn, test_name)?.and_then(|(choice, _)| choice))
        })
    }

    /// Store `choice` for `test_name`, replacing any previous decision.
    pub fn set_cached_choice(&self, test_name: &str, choice: usize) -> Result<()> {
        self.with_connection(|conn| upsert_choice(conn, test_name, choice))
    }

    /// Record test metadata. The persisted choice, if any, is left untouched.
    pub fn set_num_choices(&self, test_name: &str, num_choices: usize, has_data: bool) -> Result<()> {
        self.with_connection(|conn| upsert_num_choices(conn, test_name, num_choices, has_data))
    }

    /// Metadata and choices of all known tests, ordered by test name.
    pub fn get_test_metadata(&self) -> Result<Vec<CachedChoice>> {
        self.read_or(Vec::new(), |conn| {
            let mut stmt = conn.prepare(
                "SELECT test_name, choice, num_choices, has_data FROM ab_choices ORDER BY test_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CachedChoice {
                    test_name: row.get(0)?,
                    choice: row
                        .get::<_, Option<i64>>(1)?
                        .and_then(|choice| usize::try_from(choice).ok()),
                    num_choices: usize::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                    has_data: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Log that `choice` out of `num_choices` was made for `test_name`.
    pub fn test_chosen(&self, test_name: &str, choice: usize, num_choices: usize) -> Result<()> {
        self.with_connection(|conn| {
            append(
                conn,
                LogTable::Ab,
                ACTION_CHOSEN,
                Some(&chosen_data(test_name, choice, num_choices)),
            )
        })
    }

    /// Log that the goal `name` was reached.
    pub fn goal_reached(&self, name: &str) -> Result<()> {
        self.with_connection(|conn| {
            append(conn, LogTable::Ab, ACTION_GOAL, Some(&json!({ "test": name })))
        })
    }

    /// Log an SDK-side failure of `test_name`.
    pub fn test_failure(&self, test_name: &str, failure_type: &str) -> Result<()> {
        self.with_connection(|conn| {
            append(
                conn,
                LogTable::Ab,
                ACTION_FAILURE,
                Some(&json!({ "test": test_name, "type": failure_type })),
            )
        })
    }

    /// All A/B log entries in insertion order.
    pub fn get_ab_logs(&self) -> Result<Vec<LogEntry>> {
        self.read_or(Vec::new(), |conn| entries(conn, LogTable::Ab))
    }

    /// Delete A/B log entries with a timestamp before or equal to `before_or_equal_to`. Returns
    /// the number of deleted entries.
    pub fn delete_ab_logs(&self, before_or_equal_to: DateTime<Utc>) -> Result<usize> {
        self.with_connection(|conn| purge(conn, LogTable::Ab, before_or_equal_to))
    }

    /// Delete `last_uploaded` and every A/B log entry written before it.
    pub fn delete_ab_logs_through(&self, last_uploaded: &LogEntry) -> Result<usize> {
        self.with_connection(|conn| purge_through(conn, LogTable::Ab, last_uploaded.id))
    }

    /// Atomically look up the choice for `test_name` and, if there is none (or it is out of range
    /// for `num_choices`), make a new one with `choose`, persist it and log it.
    ///
    /// The whole operation runs in a single immediate transaction while holding the connection
    /// lock, so concurrent callers for the same test observe exactly one new assignment.
    pub fn assign_choice(
        &self,
        test_name: &str,
        num_choices: usize,
        choose: impl FnOnce(usize) -> usize,
    ) -> Result<Assignment> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let assignment = match cached_row(&tx, test_name)? {
                Some((Some(choice), stored_num_choices)) if choice < num_choices => {
                    if stored_num_choices != num_choices {
                        upsert_num_choices(&tx, test_name, num_choices, false)?;
                    }
                    Assignment::Cached(choice)
                }
                previous => {
                    if let Some((Some(previous_choice), stored_num_choices)) = previous {
                        log::debug!(target: "clutch",
                                    test_name,
                                    previous_choice,
                                    stored_num_choices,
                                    num_choices;
                                    "cached choice is out of range, reassigning");
                    }
                    let choice = choose(num_choices);
                    upsert_choice(&tx, test_name, choice)?;
                    upsert_num_choices(&tx, test_name, num_choices, false)?;
                    append(
                        &tx,
                        LogTable::Ab,
                        ACTION_CHOSEN,
                        Some(&chosen_data(test_name, choice, num_choices)),
                    )?;
                    Assignment::New(choice)
                }
            };

            tx.commit()?;
            Ok(assignment)
        })
    }

    /// Identifier of this installation. Generated randomly on first call and persisted.
    pub fn installation_id(&self) -> Result<String> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![INSTALLATION_ID_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = format!("{:032x}", rand::random::<u128>());
                    tx.execute(
                        "INSERT INTO settings (key, value) VALUES (?1, ?2)",
                        params![INSTALLATION_ID_KEY, id],
                    )?;
                    id
                }
            };
            tx.commit()?;
            Ok(id)
        })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        // A panic while holding the lock can only come from a caller-supplied `choose`; the
        // connection itself is still consistent because the transaction is rolled back on drop.
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Slot::Unopened = *slot {
            *slot = match self.open_connection() {
                Ok(conn) => Slot::Open(conn),
                Err(err) => {
                    log::warn!(target: "clutch", "failed to open local store, disabling it: {:?}", err);
                    Slot::Unavailable
                }
            };
        }

        match &mut *slot {
            Slot::Open(conn) => f(conn),
            Slot::Unopened | Slot::Unavailable => Err(Error::StoreUnavailable),
        }
    }

    fn read_or<T>(&self, default: T, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        match self.with_connection(f) {
            Err(Error::StoreUnavailable) => Ok(default),
            result => result,
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = match &self.location {
            Location::Memory => Connection::open_in_memory()?,
            Location::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!(target: "clutch", "opened local store");
        Ok(conn)
    }
}

fn chosen_data(test_name: &str, choice: usize, num_choices: usize) -> serde_json::Value {
    json!({ "test": test_name, "choice": choice, "numChoices": num_choices })
}

fn append(
    conn: &Connection,
    table: LogTable,
    action: &str,
    data: Option<&serde_json::Value>,
) -> Result<()> {
    let data_json = data.map(serde_json::to_string).transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO {} (timestamp, action, data_json) VALUES (?1, ?2, ?3)",
            table.name()
        ),
        params![Utc::now().timestamp_micros(), action, data_json],
    )?;
    Ok(())
}

fn entries(conn: &Connection, table: LogTable) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, timestamp, action, data_json FROM {} ORDER BY id ASC",
        table.name()
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, micros, action, data_json) = row?;
        let Some(timestamp) = DateTime::from_timestamp_micros(micros) else {
            log::warn!(target: "clutch", micros, action:display = action; "skipping log entry with invalid timestamp");
            continue;
        };
        let data = data_json.and_then(|json| {
            serde_json::from_str(&json)
                .inspect_err(|err| {
                    log::warn!(target: "clutch", "failed to decode log entry data: {:?}", err);
                })
                .ok()
        });
        entries.push(LogEntry {
            id,
            timestamp,
            action,
            data,
        });
    }
    Ok(entries)
}

fn purge_through(conn: &Connection, table: LogTable, last_id: i64) -> Result<usize> {
    let deleted = conn.execute(
        &format!("DELETE FROM {} WHERE id <= ?1", table.name()),
        params![last_id],
    )?;
    Ok(deleted)
}

fn purge(conn: &Connection, table: LogTable, before_or_equal_to: DateTime<Utc>) -> Result<usize> {
    let deleted = conn.execute(
        &format!("DELETE FROM {} WHERE timestamp <= ?1", table.name()),
        params![before_or_equal_to.timestamp_micros()],
    )?;
    Ok(deleted)
}

/// Returns `(choice, num_choices)` for `test_name` if the test is known.
fn cached_row(conn: &Connection, test_name: &str) -> Result<Option<(Option<usize>, usize)>> {
    let row = conn
        .query_row(
            "SELECT choice, num_choices FROM ab_choices WHERE test_name = ?1",
            params![test_name],
            |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    Ok(row.map(|(choice, num_choices)| {
        (
            choice.and_then(|choice| usize::try_from(choice).ok()),
            usize::try_from(num_choices).unwrap_or(0),
        )
    }))
}

fn upsert_choice(conn: &Connection, test_name: &str, choice: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO ab_choices (test_name, choice) VALUES (?1, ?2)
         ON CONFLICT (test_name) DO UPDATE SET choice = excluded.choice",
        params![test_name, choice as i64],
    )?;
    Ok(())
}

fn upsert_num_choices(
    conn: &Connection,
    test_name: &str,
    num_choices: usize,
    has_data: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ab_choices (test_name, num_choices, has_data) VALUES (?1, ?2, ?3)
         ON CONFLICT (test_name) DO UPDATE
         SET num_choices = excluded.num_choices, has_data = excluded.has_data",
        params![test_name, num_choices as i64, has_data],
    )?;
    Ok(())
}
