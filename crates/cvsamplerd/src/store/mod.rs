//! SQLite persistence for sampled facts and the data dictionary.
//!
//! Every write goes through a single transaction so a cycle's rows land
//! together or not at all.

pub mod dictionary;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::{debug, info};

pub use self::dictionary::{
    DataDictionaryEntry, Definitions, DictionaryError, decode_definitions, index_for,
};

use crate::pipeline::MetricRow;

pub(crate) const STORE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::store");

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS facts (
    t       INTEGER NOT NULL,
    indexs  TEXT    NOT NULL CHECK (indexs <> ''),
    devices TEXT    NOT NULL CHECK (devices <> ''),
    datum   REAL    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_facts_t ON facts (t);

CREATE TABLE IF NOT EXISTS data_dictionary (
    indexs     TEXT NOT NULL CHECK (indexs <> ''),
    statstypes TEXT NOT NULL,
    names      TEXT NOT NULL,
    types      TEXT,
    methods    TEXT,
    units      TEXT,
    precision  INTEGER
);
";

const INSERT_FACT_SQL: &str = "INSERT INTO facts (t, indexs, devices, datum) VALUES (?1, ?2, ?3, ?4)";

const INSERT_DICTIONARY_SQL: &str = "INSERT INTO data_dictionary \
     (indexs, statstypes, names, types, methods, units, precision) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Failures while talking to the database.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The database file could not be opened.
    #[error("failed to open database '{}': {source}", path.display())]
    Open {
        /// Database path.
        path: PathBuf,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// Creating tables failed.
    #[error("failed to apply schema: {0}")]
    Schema(#[source] rusqlite::Error),
    /// A transaction could not be started.
    #[error("failed to begin transaction: {0}")]
    Transaction(#[source] rusqlite::Error),
    /// A row was rejected; the batch was rolled back.
    #[error("failed to insert row for '{index}' on '{device}': {source}")]
    Insert {
        /// Index of the rejected row.
        index: String,
        /// Device of the rejected row.
        device: String,
        /// Underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
    /// Committing the transaction failed; the batch was rolled back.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] rusqlite::Error),
    /// Reading rows back failed.
    #[error("failed to query database: {0}")]
    Query(#[source] rusqlite::Error),
    /// Closing the connection failed.
    #[error("failed to close database: {0}")]
    Close(#[source] rusqlite::Error),
}

/// A committed fact as read back from the `facts` table.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRecord {
    /// Cycle sample time in unix seconds.
    pub sampled_at: i64,
    /// Metric index identifier.
    pub index: String,
    /// Device identifier.
    pub device: String,
    /// Reading.
    pub value: f64,
}

/// Open connection to the sampling database.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|source| PersistenceError::Open {
            path: path.clone(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(PersistenceError::Schema)?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(PersistenceError::Schema)?;
        debug!(target: STORE_TARGET, path = %path.display(), "database opened");
        Ok(Self { conn, path })
    }

    /// Inserts one cycle's rows in a single transaction.
    ///
    /// Returns the number of rows committed. An empty batch returns `Ok(0)`
    /// without touching the database. Any failure rolls the whole batch back.
    pub fn insert_cycle(
        &mut self,
        sampled_at: i64,
        rows: &[MetricRow],
    ) -> Result<usize, PersistenceError> {
        if rows.is_empty() {
            return Ok(0);
        }
        // Dropping `tx` on an early return rolls back.
        let tx = self
            .conn
            .transaction()
            .map_err(PersistenceError::Transaction)?;
        {
            let mut stmt = tx
                .prepare_cached(INSERT_FACT_SQL)
                .map_err(PersistenceError::Transaction)?;
            for row in rows {
                stmt.execute(params![sampled_at, row.index, row.device, row.value])
                    .map_err(|source| PersistenceError::Insert {
                        index: row.index.clone(),
                        device: row.device.clone(),
                        source,
                    })?;
            }
        }
        tx.commit().map_err(PersistenceError::Commit)?;
        debug!(target: STORE_TARGET, rows = rows.len(), sampled_at, "cycle committed");
        Ok(rows.len())
    }

    /// Replaces the data dictionary with `entries` in one transaction.
    pub fn build_dictionary(
        &mut self,
        entries: &[DataDictionaryEntry],
    ) -> Result<usize, PersistenceError> {
        let tx = self
            .conn
            .transaction()
            .map_err(PersistenceError::Transaction)?;
        tx.execute("DELETE FROM data_dictionary", [])
            .map_err(PersistenceError::Transaction)?;
        {
            let mut stmt = tx
                .prepare(INSERT_DICTIONARY_SQL)
                .map_err(PersistenceError::Transaction)?;
            for entry in entries {
                stmt.execute(params![
                    entry.index,
                    entry.stat_type,
                    entry.name,
                    entry.kind,
                    entry.method,
                    entry.unit,
                    entry.precision,
                ])
                .map_err(|source| PersistenceError::Insert {
                    index: entry.index.clone(),
                    device: String::new(),
                    source,
                })?;
            }
        }
        tx.commit().map_err(PersistenceError::Commit)?;
        info!(target: STORE_TARGET, entries = entries.len(), "data dictionary rebuilt");
        Ok(entries.len())
    }

    /// Reads back every committed fact in insertion order.
    pub fn facts(&self) -> Result<Vec<FactRecord>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT t, indexs, devices, datum FROM facts ORDER BY rowid")
            .map_err(PersistenceError::Query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FactRecord {
                    sampled_at: row.get(0)?,
                    index: row.get(1)?,
                    device: row.get(2)?,
                    value: row.get(3)?,
                })
            })
            .map_err(PersistenceError::Query)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::Query)
    }

    /// Reads back the data dictionary ordered by index.
    pub fn dictionary(&self) -> Result<Vec<DataDictionaryEntry>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT indexs, statstypes, names, types, methods, units, precision \
                 FROM data_dictionary ORDER BY indexs",
            )
            .map_err(PersistenceError::Query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DataDictionaryEntry {
                    index: row.get(0)?,
                    stat_type: row.get(1)?,
                    name: row.get(2)?,
                    kind: row.get(3)?,
                    method: row.get(4)?,
                    unit: row.get(5)?,
                    precision: row.get(6)?,
                })
            })
            .map_err(PersistenceError::Query)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::Query)
    }

    /// Flushes and closes the connection.
    pub fn close(self) -> Result<(), PersistenceError> {
        let Self { conn, path } = self;
        conn.close()
            .map_err(|(_conn, source)| PersistenceError::Close(source))?;
        debug!(target: STORE_TARGET, path = %path.display(), "database closed");
        Ok(())
    }
}
