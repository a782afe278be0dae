//! # Transactions
//!
//! A [`Tx`] wraps an open SQL transaction on the store's connection plus two
//! in-memory buffers: pending updates (path → value bytes, with the caller's
//! native value when one was supplied) and pending deletes (a path set). The
//! buffers are what the event loop fans out to subscribers after the SQL
//! commit; their map/set nature is what gives change sets last-writer-wins
//! coalescing per path. A path lives in at most one buffer at a time.
//!
//! ## Two-Table Maintenance
//!
//! Each put maintains the data table and, when full-text content is
//! supplied, the fts table in lockstep:
//!
//! - no full text: plain insert/upsert, `rowid` stays NULL
//! - full text, path already has a rowid: keep it, `UPDATE` the fts row
//! - full text, no usable rowid: allocate the next value from counter 0,
//!   insert the data row with it, `INSERT` the fts row
//!
//! Deletes remove only the data row. The fts row is left behind on purpose:
//! search joins fts to data on rowid, so an orphan can never surface, and a
//! re-insert without full text allocates no rowid to collide with it.
//!
//! Transaction control statements are issued as raw SQL against the shared
//! connection; `commit()` routes through the event loop so that fan-out and
//! subscription changes serialize.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::OptionalExtension;
use tracing::warn;

use crate::actor::{CommitRequest, Request};
use crate::codec::{encode_text, Storable};
use crate::error::{Error, Result};
use crate::raw::Raw;
use crate::reader::{sealed, Core, Queryable};

// =============================================================================
// Pending Effects
// =============================================================================

/// A buffered update: the serialized bytes plus, when the caller handed over
/// a native value, that value type-erased so subscribers can skip
/// redeserialization.
pub(crate) struct PendingValue {
    pub bytes: Vec<u8>,
    pub loaded: Option<Arc<dyn Any + Send + Sync>>,
}

// =============================================================================
// Tx
// =============================================================================

/// A write transaction. Owned exclusively by its caller between `begin` and
/// `commit`/`rollback`; reads through it observe its own uncommitted writes.
pub struct Tx {
    core: Core,
    requests: mpsc::Sender<Request>,
    updates: HashMap<String, PendingValue>,
    deletes: HashSet<String>,
    open: bool,
}

impl sealed::Sealed for Tx {
    fn core(&self) -> &Core {
        &self.core
    }
}

impl Tx {
    pub(crate) fn begin(core: Core, requests: mpsc::Sender<Request>) -> Result<Self> {
        core.conn().lock().execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            core,
            requests,
            updates: HashMap::new(),
            deletes: HashSet::new(),
            open: true,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores `value` at `path`, replacing any existing value. Non-empty
    /// `full_text` additionally indexes the row for search.
    pub fn put<T: Storable>(&mut self, path: &str, value: T, full_text: &str) -> Result<()> {
        let bytes = self.core.codec().encode(&value)?;
        self.put_bytes(path, Some(bytes), Some(Arc::new(value)), full_text, true)
    }

    /// Stores the already-serialized `raw` at `path`. Loadedness carries
    /// through to subscribers.
    pub fn put_raw<T: Storable + Clone>(
        &mut self,
        path: &str,
        raw: &Raw<T>,
        full_text: &str,
    ) -> Result<()> {
        let loaded = raw
            .cached()
            .cloned()
            .map(|value| Arc::new(value) as Arc<dyn Any + Send + Sync>);
        self.put_bytes(path, Some(raw.bytes().to_vec()), loaded, full_text, true)
    }

    /// Stores `value` only if `path` has no row yet. Returns whether the
    /// value was inserted.
    pub fn put_if_absent<T: Storable>(
        &mut self,
        path: &str,
        value: T,
        full_text: &str,
    ) -> Result<bool> {
        let bytes = self.core.codec().encode(&value)?;
        match self.put_bytes(path, Some(bytes), Some(Arc::new(value)), full_text, false) {
            Ok(()) => Ok(true),
            Err(err) if err.is_constraint_violation() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Puts every entry, without full-text indexing.
    pub fn put_all<T, P>(&mut self, entries: impl IntoIterator<Item = (P, T)>) -> Result<()>
    where
        T: Storable,
        P: Into<String>,
    {
        for (path, value) in entries {
            self.put(&path.into(), value, "")?;
        }
        Ok(())
    }

    /// Returns the existing value at `path`, or stores and returns `value`.
    pub fn get_or_put<T: Storable + Clone>(
        &mut self,
        path: &str,
        value: T,
        full_text: &str,
    ) -> Result<T> {
        if let Some(existing) = self.get::<T>(path)? {
            return Ok(existing);
        }
        self.put(path, value.clone(), full_text)?;
        Ok(value)
    }

    /// Removes the row at `path`. Recorded even when no row exists, so
    /// subscribers hear about deletes of paths they believed present.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        {
            let conn = self.core.conn().lock();
            let mut stmt = conn.prepare_cached(&format!(
                "DELETE FROM {data} WHERE path = ?",
                data = self.core.schema().data(),
            ))?;
            stmt.execute([SqlValue::Blob(encode_text(path))])?;
        }
        self.updates.remove(path);
        self.deletes.insert(path.to_string());
        Ok(())
    }

    /// The untyped put underneath the typed operations: pre-serialized
    /// bytes, an optional already-decoded native value for subscribers, and
    /// the conflict policy. Absent bytes degrade to a delete, regardless of
    /// `update_if_present`.
    pub fn put_bytes(
        &mut self,
        path: &str,
        bytes: Option<Vec<u8>>,
        loaded: Option<Arc<dyn Any + Send + Sync>>,
        full_text: &str,
        update_if_present: bool,
    ) -> Result<()> {
        let Some(bytes) = bytes else {
            return self.delete(path);
        };
        let serialized_path = encode_text(path);
        let data = self.core.schema().data().to_string();
        let conflict = if update_if_present {
            " ON CONFLICT(path) DO UPDATE SET value = EXCLUDED.value"
        } else {
            ""
        };
        // In the full-text path the upsert also adopts the bound rowid, so a
        // row that predates its full-text content picks one up.
        let conflict_with_rowid = if update_if_present {
            " ON CONFLICT(path) DO UPDATE SET value = EXCLUDED.value, rowid = EXCLUDED.rowid"
        } else {
            ""
        };

        {
            let conn = self.core.conn().lock();
            if full_text.is_empty() {
                let mut stmt = conn.prepare_cached(&format!(
                    "INSERT INTO {data}(path, value) VALUES(?, ?){conflict}"
                ))?;
                stmt.execute([
                    SqlValue::Blob(serialized_path),
                    SqlValue::Blob(bytes.clone()),
                ])?;
            } else {
                // Reuse the row's fts rowid when it has one.
                let existing: Option<Option<i64>> = {
                    let mut stmt = conn.prepare_cached(&format!(
                        "SELECT rowid FROM {data} WHERE path = ?"
                    ))?;
                    stmt.query_row([SqlValue::Blob(serialized_path.clone())], |row| {
                        row.get::<_, Option<i64>>(0)
                    })
                    .optional()?
                };

                let (rowid, update_fts) = match existing {
                    Some(Some(rowid)) => (rowid, true),
                    // New path, or a row that was never full-text indexed:
                    // allocate the next rowid from counter 0.
                    _ => {
                        let counters = self.core.schema().counters();
                        conn.execute(
                            &format!(
                                "INSERT INTO {counters}(id, value) VALUES(0, 0) \
                                 ON CONFLICT(id) DO UPDATE SET value = value+1"
                            ),
                            [],
                        )?;
                        let allocated: Option<i64> = conn
                            .query_row(
                                &format!("SELECT value FROM {counters} WHERE id = 0"),
                                [],
                                |row| row.get(0),
                            )
                            .optional()?;
                        let rowid = allocated.ok_or(Error::UnexpectedDatabaseState(
                            "counter row missing after upsert",
                        ))?;
                        (rowid, false)
                    }
                };

                let mut stmt = conn.prepare_cached(&format!(
                    "INSERT INTO {data}(path, value, rowid) VALUES(?, ?, ?){conflict_with_rowid}"
                ))?;
                stmt.execute([
                    SqlValue::Blob(serialized_path),
                    SqlValue::Blob(bytes.clone()),
                    SqlValue::Integer(rowid),
                ])?;

                let fts = self.core.schema().fts();
                if update_fts {
                    let mut stmt = conn
                        .prepare_cached(&format!("UPDATE {fts} SET value = ? WHERE rowid = ?"))?;
                    stmt.execute([
                        SqlValue::Text(full_text.to_string()),
                        SqlValue::Integer(rowid),
                    ])?;
                } else {
                    let mut stmt = conn
                        .prepare_cached(&format!("INSERT INTO {fts}(value, rowid) VALUES(?, ?)"))?;
                    stmt.execute([
                        SqlValue::Text(full_text.to_string()),
                        SqlValue::Integer(rowid),
                    ])?;
                }
            }
        }

        self.deletes.remove(path);
        self.updates
            .insert(path.to_string(), PendingValue { bytes, loaded });
        Ok(())
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Commits through the event loop and blocks until the loop has applied
    /// the SQL commit and fanned the change set out to subscribers.
    pub fn commit(mut self) -> Result<()> {
        let updates = std::mem::take(&mut self.updates);
        let deletes = std::mem::take(&mut self.deletes);
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = Request::Commit(CommitRequest {
            core: self.core.clone(),
            updates,
            deletes,
            reply: reply_tx,
        });
        if self.requests.send(request).is_err() {
            self.rollback_best_effort();
            return Err(Error::Closed);
        }
        self.open = false;
        reply_rx.recv().map_err(|_| Error::Closed)?
    }

    /// Aborts the SQL transaction directly; buffers are discarded and
    /// subscribers hear nothing.
    pub fn rollback(mut self) -> Result<()> {
        self.open = false;
        self.updates.clear();
        self.deletes.clear();
        self.core.conn().lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn rollback_best_effort(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(err) = self.core.conn().lock().execute_batch("ROLLBACK") {
            warn!(error = %err, "rollback failed");
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        self.rollback_best_effort();
    }
}
