//! Durable pipeline state backed by SQLite.
//!
//! Two tables:
//! - `seen_items(id, source, first_seen_at)` with primary key `(id, source)`
//! - `meta(key PRIMARY KEY, value)`, holding `last_run` and, while items are
//!   held back, `deferred_since`
//!
//! Every write goes through a transaction so a crash mid-run leaves the
//! previous state intact.

pub mod lock;

pub use lock::RunLock;

use crate::error::StoreError;
use crate::models::SeenItem;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

/// Meta key for the timestamp of the last committed run.
pub const LAST_RUN_KEY: &str = "last_run";

/// Meta key for the oldest timestamp the next fetch must reach back to.
pub const DEFERRED_SINCE_KEY: &str = "deferred_since";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS seen_items (
    id TEXT NOT NULL,
    source TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    PRIMARY KEY (id, source)
);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Owner of all persisted pipeline state.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening state store at {}", path.display());
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Whether `(id, source)` has already been committed.
    pub fn has_seen(&self, id: &str, source: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM seen_items WHERE id = ?1 AND source = ?2",
                params![id, source],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // Runs write through commit_run; these two stand alone for tests.
    #[allow(dead_code)]
    /// Record a batch of processed items. All or nothing.
    ///
    /// Pairs already present keep their original `first_seen_at`.
    /// Returns the number of newly inserted rows.
    pub fn mark_seen(&mut self, batch: &[SeenItem]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let inserted = insert_seen(&tx, batch)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Timestamp of the last committed run, if any.
    pub fn last_run(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get_timestamp(LAST_RUN_KEY)
    }

    /// Oldest occurrence time among items a previous run fetched but did not
    /// deliver, if any are outstanding.
    pub fn deferred_since(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get_timestamp(DEFERRED_SINCE_KEY)
    }

    fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.get_meta(key)? {
            Some(value) => parse_timestamp(key, &value).map(Some),
            None => Ok(None),
        }
    }

    #[allow(dead_code)] // See mark_seen
    pub fn set_last_run(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_meta(LAST_RUN_KEY, &format_timestamp(at))
    }

    /// Forget every seen item recorded for exactly one source.
    pub fn reset_seen(&mut self, source: &str) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM seen_items WHERE source = ?1", params![source])?;
        tx.commit()?;
        info!("Reset {} seen item(s) for source '{}'", removed, source);
        Ok(removed)
    }

    /// Commit point of a run: mark the delivered items seen, advance
    /// `last_run` and replace `deferred_since` in one transaction.
    pub fn commit_run(
        &mut self,
        batch: &[SeenItem],
        now: DateTime<Utc>,
        deferred_since: Option<DateTime<Utc>>,
    ) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let inserted = insert_seen(&tx, batch)?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![LAST_RUN_KEY, format_timestamp(now)],
        )?;
        match deferred_since {
            Some(at) => tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![DEFERRED_SINCE_KEY, format_timestamp(at)],
            )?,
            None => tx.execute(
                "DELETE FROM meta WHERE key = ?1",
                params![DEFERRED_SINCE_KEY],
            )?,
        };
        tx.commit()?;
        debug!(
            "Committed {} new seen item(s) of {} delivered",
            inserted,
            batch.len()
        );
        Ok(inserted)
    }

    /// Number of seen items recorded for `source`.
    #[allow(dead_code)] // Inspection helper
    pub fn seen_count(&self, source: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM seen_items WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn insert_seen(tx: &rusqlite::Transaction<'_>, batch: &[SeenItem]) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO seen_items (id, source, first_seen_at) VALUES (?1, ?2, ?3)",
    )?;
    let mut inserted = 0;
    for item in batch {
        inserted += stmt.execute(params![
            item.id,
            item.source,
            format_timestamp(item.first_seen_at)
        ])?;
    }
    Ok(inserted)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(key: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            key: key.to_string(),
            value: value.to_string(),
        })
}
