//! # SQLite Schema
//!
//! All data for one logical store lives in four objects derived from a
//! schema prefix `S`, so multiple stores can share a database file:
//!
//! ```text
//! S_data              path TEXT PRIMARY KEY, value BLOB, rowid INTEGER
//!                     (WITHOUT ROWID: index-organized for fast path scans;
//!                      the visible rowid column is non-null only for
//!                      full-text-indexed rows and joins to S_fts)
//! S_data_value_index  partial index on value restricted to text-tagged
//!                     values, accelerating joins on path = value
//! S_fts               fts5 virtual table over the full-text content,
//!                     keyed by the same integer rowid as S_data
//! S_counters          id INTEGER PRIMARY KEY, value INTEGER; counter 0
//!                     allocates fts rowids, monotonically, never reused
//! ```
//!
//! Paths and values are stored in their codec-encoded form; a text value is
//! `'T'` followed by UTF-8, which is what the partial index's
//! `SUBSTR(CAST(value AS TEXT), 1, 1) = 'T'` predicate keys on.
//!
//! The fts table uses `tokenize='porter trigram'` so that stemming works for
//! Latin scripts while CJK text still matches through plain trigrams.

use rusqlite::Connection;

use crate::error::Result;

// =============================================================================
// Schema
// =============================================================================

/// The object names derived from one schema prefix.
#[derive(Debug, Clone)]
pub struct Schema {
    prefix: String,
    data: String,
    value_index: String,
    fts: String,
    counters: String,
}

impl Schema {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            data: format!("{prefix}_data"),
            value_index: format!("{prefix}_data_value_index"),
            fts: format!("{prefix}_fts"),
            counters: format!("{prefix}_counters"),
            prefix,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The data table name (`S_data`).
    pub fn data(&self) -> &str {
        &self.data
    }

    /// The full-text virtual table name (`S_fts`).
    pub fn fts(&self) -> &str {
        &self.fts
    }

    /// The counter table name (`S_counters`).
    pub fn counters(&self) -> &str {
        &self.counters
    }

    /// Creates the four schema objects if they do not exist. Idempotent.
    pub fn create_all(&self, conn: &Connection) -> Result<()> {
        // Index-organized data table. The declared rowid column shadows
        // nothing in a WITHOUT ROWID table; it is managed manually and left
        // NULL for rows without full-text content.
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {data} \
             (path TEXT PRIMARY KEY, value BLOB, rowid INTEGER) WITHOUT ROWID",
            data = self.data,
        ))?;

        // Partial index over text values only, for detail joins on
        // path = value.
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {data}(value) \
             WHERE SUBSTR(CAST(value AS TEXT), 1, 1) = 'T'",
            index = self.value_index,
            data = self.data,
        ))?;

        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {fts} \
             USING fts5(value, tokenize='porter trigram')",
            fts = self.fts,
        ))?;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {counters} \
             (id INTEGER PRIMARY KEY, value INTEGER)",
            counters = self.counters,
        ))?;

        Ok(())
    }
}

/// Connection pragmas applied once per database handle.
///
/// WAL keeps readers unblocked during writes; NORMAL syncs the WAL on commit
/// only. In-memory databases accept these as no-ops.
pub(crate) fn apply_pragmas(conn: &Connection) -> Result<()> {
    // journal_mode reports the resulting mode as a row; the others are
    // silent.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
